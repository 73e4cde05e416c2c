// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/model.rs - 模型
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

use std::str::FromStr;

use ndarray::ArrayD;
use thiserror::Error;

use crate::{error::ValidationError, preprocess::InputTensor};

pub mod decode;
mod detector;
mod labels;
pub mod mask;
pub mod nms;
#[cfg(feature = "onnx_runtime")]
mod onnx;

pub use self::detector::{Detector, DetectorBuilder};
pub use self::labels::{LabelError, Labels, UNKNOWN_LABEL};
pub use self::mask::SegMask;
#[cfg(feature = "onnx_runtime")]
pub use self::onnx::OnnxInference;

pub const SUPPORTED_VERSIONS: &str = "yolov5, yolov8, yolov8seg, yolo11";

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("模型加载错误: {0}")]
  ModelLoad(#[from] std::io::Error),
  #[error("模型路径错误: {0}")]
  ModelPath(String),
  #[error("推理后端错误: {0}")]
  Backend(String),
  #[error("输入张量形状不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  InputShape {
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
}

/// 推理引擎边界
///
/// 输入张量形状在模型加载后固定；输出形状由模型系列决定。
/// 实现不要求可重入，调度器保证只有工作线程调用 `run`。
pub trait Inference {
  fn input_shape(&self) -> &[usize];
  fn run(&mut self, input: &InputTensor) -> Result<RawOutput, InferenceError>;
}

impl<T: Inference + ?Sized> Inference for Box<T> {
  fn input_shape(&self) -> &[usize] {
    (**self).input_shape()
  }

  fn run(&mut self, input: &InputTensor) -> Result<RawOutput, InferenceError> {
    (**self).run(input)
  }
}

/// 推理输出，第一个张量决定模型系列，分割模型额外携带原型掩码张量
#[derive(Debug, Clone, Default)]
pub struct RawOutput {
  tensors: Vec<ArrayD<f32>>,
}

impl RawOutput {
  pub fn new(tensors: Vec<ArrayD<f32>>) -> Self {
    Self { tensors }
  }

  pub fn primary(&self) -> Option<&ArrayD<f32>> {
    self.tensors.first()
  }

  pub fn prototypes(&self) -> Option<&ArrayD<f32>> {
    self.tensors.get(1)
  }

  pub fn len(&self) -> usize {
    self.tensors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tensors.is_empty()
  }
}

impl From<ArrayD<f32>> for RawOutput {
  fn from(tensor: ArrayD<f32>) -> Self {
    Self::new(vec![tensor])
  }
}

/// 模型系列，加载时确定，会话内不变
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
  /// `[1, N, 5+C]`，逐行，含目标置信度
  V5,
  /// `[1, 4+C, N]`，逐列
  V8,
  /// 同 V8，左上角坐标截断到 0
  V11,
  /// `[1, 4+C+M, N]` 加原型掩码
  V8Seg,
}

impl ModelVariant {
  pub fn name(self) -> &'static str {
    match self {
      ModelVariant::V5 => "yolov5",
      ModelVariant::V8 => "yolov8",
      ModelVariant::V11 => "yolo11",
      ModelVariant::V8Seg => "yolov8seg",
    }
  }

  pub fn has_masks(self) -> bool {
    matches!(self, ModelVariant::V8Seg)
  }
}

impl FromStr for ModelVariant {
  type Err = ValidationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "yolov5" => Ok(ModelVariant::V5),
      "yolov8" => Ok(ModelVariant::V8),
      "yolov8seg" => Ok(ModelVariant::V8Seg),
      "yolo11" | "yolov11" => Ok(ModelVariant::V11),
      _ => Err(ValidationError::UnsupportedVersion(s.to_string())),
    }
  }
}

impl std::fmt::Display for ModelVariant {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

const DEFAULT_THRESHOLD: f32 = 0.5;

/// 单次检测请求的阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
  /// NMS 交并比阈值
  pub iou: f32,
  /// 目标置信度阈值，仅 V5 使用
  pub conf: f32,
  /// 最终类别置信度阈值
  pub class: f32,
}

impl Default for Thresholds {
  fn default() -> Self {
    Self {
      iou: DEFAULT_THRESHOLD,
      conf: DEFAULT_THRESHOLD,
      class: DEFAULT_THRESHOLD,
    }
  }
}

impl Thresholds {
  /// 缺省的阈值各自取默认值
  pub fn from_options(iou: Option<f32>, conf: Option<f32>, class: Option<f32>) -> Self {
    let default = Self::default();
    Self {
      iou: iou.unwrap_or(default.iou),
      conf: conf.unwrap_or(default.conf),
      class: class.unwrap_or(default.class),
    }
  }
}

/// 解码得到的候选框，坐标位于模型输入像素空间
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
  pub class_index: usize,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
  /// 在原始输出张量中的检测序号
  pub anchor: usize,
}

/// 最终检测结果，坐标位于源图像像素空间
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub label: String,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
  pub mask: Option<SegMask>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[Detection]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
    self.items.iter()
  }
}

impl From<Vec<Detection>> for DetectResult {
  fn from(items: Vec<Detection>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_versions_case_insensitively() {
    assert_eq!("YOLOv5".parse::<ModelVariant>(), Ok(ModelVariant::V5));
    assert_eq!("yolov8seg".parse::<ModelVariant>(), Ok(ModelVariant::V8Seg));
    assert_eq!("yolov11".parse::<ModelVariant>(), Ok(ModelVariant::V11));
    assert_eq!("Yolo11".parse::<ModelVariant>(), Ok(ModelVariant::V11));
    let err = "yolov7".parse::<ModelVariant>().unwrap_err();
    assert!(err.to_string().contains(SUPPORTED_VERSIONS));
  }

  #[test]
  fn thresholds_default_independently() {
    let t = Thresholds::from_options(Some(0.3), None, Some(0.25));
    assert_eq!(t.iou, 0.3);
    assert_eq!(t.conf, 0.5);
    assert_eq!(t.class, 0.25);
  }
}
