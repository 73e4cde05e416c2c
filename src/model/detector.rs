// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/model/detector.rs - 检测器与构建器
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::PathBuf;

use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, PipelineError, ValidationError,
  frame::{PixelBuffer, Rotation},
  model::{
    DetectResult, Inference, InferenceError, Labels, ModelVariant, Thresholds,
    decode::decode,
    mask::extract_masks,
    nms::{restore, suppress},
  },
  preprocess::{InputGeometry, TensorPreprocessor},
  query_value,
};

const DEFAULT_MEAN: f32 = 0.0;
const DEFAULT_STD: f32 = 255.0;

/// 检测器配置
///
/// URL 形式为 `<版本>:///<模型路径>?labels=<标签路径>&rotation=90&threads=4`，
/// 其中版本即 [`ModelVariant`] 支持的名称，例如 `yolov8:///models/best.onnx`。
#[derive(Debug, Clone)]
pub struct DetectorBuilder {
  model_path: PathBuf,
  labels_path: Option<PathBuf>,
  variant: ModelVariant,
  rotation: Rotation,
  num_threads: Option<usize>,
  mean: f32,
  std: f32,
}

/// 解析数值型查询参数，失败时保留原始文本
fn number<T: std::str::FromStr>(
  url: &Url,
  key: &'static str,
) -> Result<Option<T>, ValidationError> {
  query_value::<T>(url, key).map_err(|_| {
    let raw = url
      .query_pairs()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v.into_owned())
      .unwrap_or_default();
    ValidationError::InvalidArgument(key, raw)
  })
}

impl FromUrl for DetectorBuilder {
  type Error = PipelineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let variant = url.scheme().parse::<ModelVariant>()?;
    if url.path().is_empty() || url.path() == "/" {
      return Err(InferenceError::ModelPath(format!("模型路径为空: {}", url)).into());
    }

    let labels_path = url
      .query_pairs()
      .find(|(k, _)| k == "labels")
      .map(|(_, v)| PathBuf::from(v.as_ref()));
    let rotation = query_value::<Rotation>(url, "rotation")?.unwrap_or_default();
    let num_threads = number::<usize>(url, "threads")?;
    let mean = number::<f32>(url, "mean")?.unwrap_or(DEFAULT_MEAN);
    let std = number::<f32>(url, "std")?.unwrap_or(DEFAULT_STD);

    Ok(Self {
      model_path: PathBuf::from(url.path()),
      labels_path,
      variant,
      rotation,
      num_threads,
      mean,
      std,
    })
  }
}

impl DetectorBuilder {
  pub fn new<P: Into<PathBuf>>(model_path: P, variant: ModelVariant) -> Self {
    Self {
      model_path: model_path.into(),
      labels_path: None,
      variant,
      rotation: Rotation::Deg0,
      num_threads: None,
      mean: DEFAULT_MEAN,
      std: DEFAULT_STD,
    }
  }

  pub fn labels<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.labels_path = Some(path.into());
    self
  }

  pub fn rotation(mut self, rotation: Rotation) -> Self {
    self.rotation = rotation;
    self
  }

  pub fn num_threads(mut self, threads: usize) -> Self {
    self.num_threads = Some(threads);
    self
  }

  pub fn normalization(mut self, mean: f32, std: f32) -> Self {
    self.mean = mean;
    self.std = std;
    self
  }

  pub fn model_path(&self) -> &std::path::Path {
    &self.model_path
  }

  pub fn variant(&self) -> ModelVariant {
    self.variant
  }

  /// 使用给定推理后端构建检测器
  pub fn build_with<I>(self, inference: I) -> Result<Detector, PipelineError>
  where
    I: Inference + Send + 'static,
  {
    let labels = match &self.labels_path {
      Some(path) => Labels::from_path(path)?,
      None => {
        warn!("未指定标签文件，所有类别将标记为 unknown");
        Labels::default()
      }
    };
    Detector::new(Box::new(inference), self.variant, labels, self.rotation)?
      .with_normalization(self.mean, self.std)
  }

  /// 通过 ONNX Runtime 加载模型文件
  #[cfg(feature = "onnx_runtime")]
  pub fn build(self) -> Result<Detector, PipelineError> {
    let inference = crate::model::OnnxInference::load(&self.model_path, self.num_threads)?;
    self.build_with(inference)
  }
}

/// 已加载的检测器，持有推理句柄、标签与模型系列
pub struct Detector {
  inference: Box<dyn Inference + Send>,
  variant: ModelVariant,
  labels: Labels,
  rotation: Rotation,
  geometry: InputGeometry,
  mean: f32,
  std: f32,
}

impl std::fmt::Debug for Detector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Detector")
      .field("variant", &self.variant)
      .field("labels", &self.labels.len())
      .field("rotation", &self.rotation)
      .field("geometry", &self.geometry)
      .finish()
  }
}

impl Detector {
  pub fn new(
    inference: Box<dyn Inference + Send>,
    variant: ModelVariant,
    labels: Labels,
    rotation: Rotation,
  ) -> Result<Self, PipelineError> {
    let geometry = InputGeometry::from_shape(inference.input_shape())?;
    info!(
      "检测器就绪: {}, 输入 {}x{}, 标签 {} 个, 旋转 {} 度",
      variant,
      geometry.width,
      geometry.height,
      labels.len(),
      rotation
    );
    Ok(Self {
      inference,
      variant,
      labels,
      rotation,
      geometry,
      mean: DEFAULT_MEAN,
      std: DEFAULT_STD,
    })
  }

  fn with_normalization(mut self, mean: f32, std: f32) -> Result<Self, PipelineError> {
    if !std.is_finite() || std == 0.0 || !mean.is_finite() {
      return Err(ValidationError::InvalidNormalization { mean, std }.into());
    }
    self.mean = mean;
    self.std = std;
    Ok(self)
  }

  pub fn variant(&self) -> ModelVariant {
    self.variant
  }

  /// 加载时配置的帧旋转角度
  pub fn rotation(&self) -> Rotation {
    self.rotation
  }

  pub fn labels(&self) -> &Labels {
    &self.labels
  }

  pub fn input_geometry(&self) -> InputGeometry {
    self.geometry
  }

  /// 在一幅图像上执行完整的检测流程
  pub fn detect(
    &mut self,
    pixels: &PixelBuffer,
    preprocessor: &TensorPreprocessor,
    thresholds: &Thresholds,
  ) -> Result<DetectResult, PipelineError> {
    let (input_width, input_height) = (self.geometry.width, self.geometry.height);
    let tensor = preprocessor
      .prepare_auto(pixels, input_width, input_height, self.mean, self.std)?
      .conform(&self.geometry)?;

    let output = self.inference.run(&tensor)?;
    drop(tensor);
    debug!("推理输出张量数量: {}", output.len());

    let (iw, ih) = (input_width as f32, input_height as f32);
    let classes = (!self.labels.is_empty()).then(|| self.labels.len());
    let candidates = decode(self.variant, &output, thresholds, iw, ih, classes)?;
    let survivors = suppress(candidates, thresholds.iou);

    let mut detections = restore(
      &survivors,
      iw,
      ih,
      pixels.width() as f32,
      pixels.height() as f32,
      &self.labels,
    );
    if self.variant.has_masks() {
      let masks = extract_masks(&output, &survivors, iw, ih)?;
      for (detection, mask) in detections.iter_mut().zip(masks) {
        detection.mask = Some(mask);
      }
    }

    debug!("检测完成: {} 个目标", detections.len());
    Ok(DetectResult::from(detections))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    model::{RawOutput, decode::DecodeError},
    preprocess::InputTensor,
  };
  use ndarray::{Array3, Array4, ArrayD, IxDyn, s};

  struct Fixed {
    shape: Vec<usize>,
    output: RawOutput,
    seen: Vec<Vec<usize>>,
  }

  impl Inference for Fixed {
    fn input_shape(&self) -> &[usize] {
      &self.shape
    }

    fn run(&mut self, input: &InputTensor) -> Result<RawOutput, InferenceError> {
      self.seen.push(input.shape().to_vec());
      Ok(self.output.clone())
    }
  }

  /// 每个内层数组是一个检测，按列排布为 `[1, features, N]`
  fn column_output<const F: usize>(detections: &[[f32; F]]) -> ArrayD<f32> {
    let mut tensor = Array3::<f32>::zeros((1, F, detections.len()));
    for (n, det) in detections.iter().enumerate() {
      for (f, v) in det.iter().enumerate() {
        tensor[[0, f, n]] = *v;
      }
    }
    tensor.into_dyn()
  }

  fn fixed(shape: Vec<usize>, output: RawOutput) -> Fixed {
    Fixed {
      shape,
      output,
      seen: Vec::new(),
    }
  }

  fn gray(width: u32, height: u32) -> PixelBuffer {
    PixelBuffer::from_rgba(width, height, vec![128; (width * height * 4) as usize]).unwrap()
  }

  #[test]
  fn parses_builder_from_url() {
    let url =
      Url::parse("yolov11:///models/best.onnx?labels=/models/coco.txt&rotation=90&threads=4")
        .unwrap();
    let builder = DetectorBuilder::from_url(&url).unwrap();
    assert_eq!(builder.variant(), ModelVariant::V11);
    assert_eq!(builder.model_path(), std::path::Path::new("/models/best.onnx"));
    assert_eq!(builder.labels_path, Some(PathBuf::from("/models/coco.txt")));
    assert_eq!(builder.rotation, Rotation::Deg90);
    assert_eq!(builder.num_threads, Some(4));
    assert_eq!((builder.mean, builder.std), (0.0, 255.0));
  }

  #[test]
  fn rejects_unknown_version_and_rotation() {
    let url = Url::parse("yolov7:///m.onnx").unwrap();
    assert!(matches!(
      DetectorBuilder::from_url(&url),
      Err(PipelineError::Validation(ValidationError::UnsupportedVersion(_)))
    ));
    let url = Url::parse("yolov8:///m.onnx?rotation=45").unwrap();
    assert!(matches!(
      DetectorBuilder::from_url(&url),
      Err(PipelineError::Validation(ValidationError::InvalidRotation(45)))
    ));
  }

  #[test]
  fn unparsable_numbers_keep_their_text() {
    let cases = [
      ("yolov8:///m.onnx?threads=many", "threads", "many"),
      ("yolov8:///m.onnx?mean=abc", "mean", "abc"),
      ("yolov8:///m.onnx?std=wide", "std", "wide"),
      ("yolov8:///m.onnx?rotation=left", "rotation", "left"),
    ];
    for (url, key, text) in cases {
      let url = Url::parse(url).unwrap();
      match DetectorBuilder::from_url(&url) {
        Err(PipelineError::Validation(ValidationError::InvalidArgument(k, raw))) => {
          assert_eq!((k, raw.as_str()), (key, text));
        }
        other => panic!("{:?}", other),
      }
    }
  }

  #[test]
  fn detects_and_restores_to_source_space() {
    let output = column_output(&[
      [0.5, 0.5, 0.2, 0.2, 0.9, 0.1],
      [0.52, 0.5, 0.2, 0.2, 0.1, 0.8],
    ]);
    let inference = fixed(vec![1, 100, 100, 3], RawOutput::from(output));
    let labels: Labels = ["person", "car"].into_iter().collect();
    let mut detector =
      Detector::new(Box::new(inference), ModelVariant::V8, labels, Rotation::Deg0).unwrap();

    let result = detector
      .detect(&gray(200, 100), &TensorPreprocessor::new(), &Thresholds::default())
      .unwrap();
    assert_eq!(result.len(), 1);
    let item = &result.items[0];
    assert_eq!(item.label, "person");
    assert!((item.bbox[0] - 80.0).abs() < 1e-3);
    assert!((item.bbox[1] - 40.0).abs() < 1e-3);
    assert!((item.bbox[2] - 120.0).abs() < 1e-3);
    assert!((item.bbox[3] - 60.0).abs() < 1e-3);
    assert!(item.mask.is_none());
  }

  #[test]
  fn rank_three_models_receive_unbatched_tensor() {
    let inference = fixed(vec![32, 32, 3], RawOutput::from(ArrayD::zeros(IxDyn(&[1, 6, 4]))));
    let mut detector = DetectorBuilder::new("m.onnx", ModelVariant::V8)
      .build_with(inference)
      .unwrap();
    let result = detector
      .detect(&gray(16, 16), &TensorPreprocessor::new(), &Thresholds::default())
      .unwrap();
    assert!(result.is_empty());
    assert!(!detector.input_geometry().batched);
  }

  #[test]
  fn rejects_unsupported_input_shape() {
    let inference = fixed(
      vec![1, 3, 640, 640, 1],
      RawOutput::from(ArrayD::zeros(IxDyn(&[1, 6, 4]))),
    );
    assert!(matches!(
      DetectorBuilder::new("m.onnx", ModelVariant::V8).build_with(inference),
      Err(PipelineError::Validation(ValidationError::UnsupportedTensorRank(5)))
    ));
  }

  #[test]
  fn seg_masks_follow_nms_survivors() {
    // 1 个类别、2 个掩码系数；第二个检测与第一个高度重叠，被抑制
    let primary = column_output(&[
      [0.25, 0.25, 0.5, 0.5, 0.9, 5.0, 0.0],
      [0.26, 0.25, 0.5, 0.5, 0.8, 5.0, 0.0],
      [0.75, 0.75, 0.5, 0.5, 0.7, 0.0, 5.0],
    ]);
    let mut protos = Array4::<f32>::zeros((1, 4, 4, 2));
    protos.slice_mut(s![.., .., .., 0]).fill(1.0);
    protos.slice_mut(s![.., .., .., 1]).fill(-1.0);
    let output = RawOutput::new(vec![primary, protos.into_dyn()]);

    let labels: Labels = ["cell"].into_iter().collect();
    let inference = fixed(vec![1, 8, 8, 3], output);
    let mut detector =
      Detector::new(Box::new(inference), ModelVariant::V8Seg, labels, Rotation::Deg0).unwrap();
    let result = detector
      .detect(&gray(8, 8), &TensorPreprocessor::new(), &Thresholds::default())
      .unwrap();

    assert_eq!(result.len(), 2);
    let scores: Vec<f32> = result.iter().map(|d| d.score).collect();
    assert_eq!(scores, vec![0.9, 0.7]);

    let first = result.items[0].mask.as_ref().unwrap();
    assert_eq!((first.x, first.y, first.width, first.height), (0, 0, 2, 2));
    assert_eq!(first.area(), 4);
    let second = result.items[1].mask.as_ref().unwrap();
    assert_eq!((second.x, second.y, second.width, second.height), (2, 2, 2, 2));
    assert_eq!(second.area(), 0);
    assert_eq!((second.grid_width, second.grid_height), (4, 4));
  }

  #[test]
  fn output_not_matching_labels_is_rejected() {
    // 两个类别的 V8 输出，但标签文件有三个类别
    let output = column_output(&[[0.5, 0.5, 0.2, 0.2, 0.9, 0.1]]);
    let labels: Labels = ["person", "car", "bus"].into_iter().collect();
    let inference = fixed(vec![1, 16, 16, 3], RawOutput::from(output));
    let mut detector =
      Detector::new(Box::new(inference), ModelVariant::V8, labels, Rotation::Deg0).unwrap();
    assert!(matches!(
      detector.detect(&gray(16, 16), &TensorPreprocessor::new(), &Thresholds::default()),
      Err(PipelineError::Decode(DecodeError::ChannelMismatch { .. }))
    ));
  }
}
