// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/model/decode.rs - 模型输出解码
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

//! 各模型系列的输出布局：
//!
//! | 系列 | 形状 | 布局 | 目标置信度 |
//! |---|---|---|---|
//! | V5 | `[1, N, 5+C]` | 每行一个检测 | 第 4 列 |
//! | V8 / V11 | `[1, 4+C, N]` | 每列一个检测 | 无 |
//! | V8-Seg | `[1, 4+C+M, N]` | 同 V8，末尾 M 个掩码系数 | 无 |
//!
//! 框统一按 `(cx, cy, w, h)` 解码为角点形式，并按模型输入宽高缩放。

use ndarray::{ArrayD, ArrayView2, Axis, Ix2, s};
use thiserror::Error;
use tracing::{debug, error};

use crate::model::{Candidate, ModelVariant, RawOutput, Thresholds, mask::Prototypes};

const BOX_CHANNELS: usize = 4;
const V5_OBJECTNESS_INDEX: usize = 4;
const V5_CLASS_START: usize = 5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
  #[error("缺少输出张量")]
  MissingOutput,
  #[error("{variant} 输出维度数不匹配: 期望 {expected}, 实际 {actual}")]
  RankMismatch {
    variant: ModelVariant,
    expected: usize,
    actual: usize,
  },
  #[error("批次大小必须为 1, 实际为 {0}")]
  BatchMismatch(usize),
  #[error("{variant} 输出通道数不匹配: {detail}")]
  ChannelMismatch {
    variant: ModelVariant,
    detail: String,
  },
  #[error("缺少原型掩码张量")]
  MissingPrototypes,
  #[error("原型掩码张量形状无效: {0:?}")]
  PrototypeShape(Vec<usize>),
}

/// 去掉批次维度后的二维检测表
pub(crate) fn detection_table(
  variant: ModelVariant,
  tensor: &ArrayD<f32>,
) -> Result<ArrayView2<'_, f32>, DecodeError> {
  if tensor.ndim() != 3 {
    error!("{} 输出维度数不匹配: {:?}", variant, tensor.shape());
    return Err(DecodeError::RankMismatch {
      variant,
      expected: 3,
      actual: tensor.ndim(),
    });
  }
  if tensor.shape()[0] != 1 {
    return Err(DecodeError::BatchMismatch(tensor.shape()[0]));
  }
  tensor
    .index_axis(Axis(0), 0)
    .into_dimensionality::<Ix2>()
    .map_err(|_| DecodeError::RankMismatch {
      variant,
      expected: 3,
      actual: tensor.ndim(),
    })
}

/// V8-Seg 每个检测的类别数，由输出行数减去框与掩码系数得到
pub(crate) fn seg_class_count(rows: usize, coefficients: usize) -> Result<usize, DecodeError> {
  match rows.checked_sub(BOX_CHANNELS + coefficients) {
    Some(classes) if classes >= 1 => Ok(classes),
    _ => Err(DecodeError::ChannelMismatch {
      variant: ModelVariant::V8Seg,
      detail: format!(
        "输出行数 {} 不足以容纳 4 个框参数、{} 个掩码系数和至少 1 个类别",
        rows, coefficients
      ),
    }),
  }
}

/// 解码原始输出为候选框，尚未去重
///
/// `expected_classes` 为标签数量。给出时按系列校验输出通道数恰好为
/// `5+C`、`4+C` 或 `4+C+M`，否则类别数由张量形状推断。
pub fn decode(
  variant: ModelVariant,
  output: &RawOutput,
  thresholds: &Thresholds,
  input_width: f32,
  input_height: f32,
  expected_classes: Option<usize>,
) -> Result<Vec<Candidate>, DecodeError> {
  let tensor = output.primary().ok_or(DecodeError::MissingOutput)?;
  let table = detection_table(variant, tensor)?;
  debug!("{} 检测表形状: {:?}", variant, table.shape());

  let candidates = match variant {
    ModelVariant::V5 => {
      if table.ncols() <= V5_CLASS_START {
        return Err(DecodeError::ChannelMismatch {
          variant,
          detail: format!("每行至少需要 6 个值, 实际为 {}", table.ncols()),
        });
      }
      check_channels(variant, table.ncols(), V5_CLASS_START, expected_classes)?;
      decode_rows(table, thresholds, input_width, input_height)
    }
    ModelVariant::V8 | ModelVariant::V11 => {
      if table.nrows() <= BOX_CHANNELS {
        return Err(DecodeError::ChannelMismatch {
          variant,
          detail: format!("至少需要 5 行, 实际为 {}", table.nrows()),
        });
      }
      check_channels(variant, table.nrows(), BOX_CHANNELS, expected_classes)?;
      let classes = table.nrows() - BOX_CHANNELS;
      let clamp_origin = variant == ModelVariant::V11;
      decode_columns(table, classes, thresholds.class, clamp_origin, input_width, input_height)
    }
    ModelVariant::V8Seg => {
      let prototypes = output.prototypes().ok_or(DecodeError::MissingPrototypes)?;
      let coefficients = Prototypes::from_tensor(prototypes)?.channels();
      check_channels(variant, table.nrows(), BOX_CHANNELS + coefficients, expected_classes)?;
      let classes = seg_class_count(table.nrows(), coefficients)?;
      decode_columns(table, classes, thresholds.class, false, input_width, input_height)
    }
  };

  debug!("NMS 前候选框数量: {}", candidates.len());
  Ok(candidates)
}

/// 通道数必须恰好等于固定通道数加类别数
fn check_channels(
  variant: ModelVariant,
  actual: usize,
  fixed: usize,
  expected_classes: Option<usize>,
) -> Result<(), DecodeError> {
  let Some(classes) = expected_classes else {
    return Ok(());
  };
  if actual == fixed + classes {
    return Ok(());
  }
  error!(
    "{} 输出通道数 {} 与 {} 个类别不符, 期望 {}",
    variant,
    actual,
    classes,
    fixed + classes
  );
  Err(DecodeError::ChannelMismatch {
    variant,
    detail: format!(
      "期望 {} 个通道 ({} + {} 个类别), 实际为 {}",
      fixed + classes,
      fixed,
      classes,
      actual
    ),
  })
}

fn decode_rows(
  table: ArrayView2<'_, f32>,
  thresholds: &Thresholds,
  input_width: f32,
  input_height: f32,
) -> Vec<Candidate> {
  let mut candidates = Vec::new();
  for (anchor, row) in table.outer_iter().enumerate() {
    let objectness = row[V5_OBJECTNESS_INDEX];
    if objectness < thresholds.conf {
      continue;
    }

    let Some((class_index, class_score)) =
      best_class(row.slice(s![V5_CLASS_START..]).iter().copied())
    else {
      continue;
    };

    let score = objectness * class_score;
    if score > thresholds.class {
      candidates.push(Candidate {
        class_index,
        score,
        bbox: corners(row[0], row[1], row[2], row[3], input_width, input_height),
        anchor,
      });
    }
  }
  candidates
}

fn decode_columns(
  table: ArrayView2<'_, f32>,
  classes: usize,
  class_threshold: f32,
  clamp_origin: bool,
  input_width: f32,
  input_height: f32,
) -> Vec<Candidate> {
  let mut candidates = Vec::new();
  for (anchor, column) in table.axis_iter(Axis(1)).enumerate() {
    let Some((class_index, score)) = best_class(
      column
        .slice(s![BOX_CHANNELS..BOX_CHANNELS + classes])
        .iter()
        .copied(),
    ) else {
      continue;
    };

    if score <= class_threshold || score.is_nan() {
      continue;
    }

    let mut bbox = corners(
      column[0],
      column[1],
      column[2],
      column[3],
      input_width,
      input_height,
    );
    if clamp_origin {
      bbox[0] = bbox[0].max(0.0);
      bbox[1] = bbox[1].max(0.0);
    }

    candidates.push(Candidate {
      class_index,
      score,
      bbox,
      anchor,
    });
  }
  candidates
}

/// 线性扫描，严格大于才替换，相等时保留最先出现的类别
fn best_class(scores: impl IntoIterator<Item = f32>) -> Option<(usize, f32)> {
  let mut scores = scores.into_iter().enumerate();
  let (mut best_index, mut best_score) = scores.next()?;
  for (index, score) in scores {
    if score > best_score {
      best_score = score;
      best_index = index;
    }
  }
  Some((best_index, best_score))
}

fn corners(cx: f32, cy: f32, w: f32, h: f32, input_width: f32, input_height: f32) -> [f32; 4] {
  [
    (cx - w / 2.0) * input_width,
    (cy - h / 2.0) * input_height,
    (cx + w / 2.0) * input_width,
    (cy + h / 2.0) * input_height,
  ]
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::{Array3, IxDyn};

  fn assert_box(actual: [f32; 4], expected: [f32; 4]) {
    for (a, e) in actual.iter().zip(expected) {
      assert!((a - e).abs() < 1e-3, "{:?} != {:?}", actual, expected);
    }
  }

  fn rows(data: &[&[f32]]) -> RawOutput {
    let width = data[0].len();
    let flat: Vec<f32> = data.iter().flat_map(|r| r.iter().copied()).collect();
    let tensor = Array3::from_shape_vec((1, data.len(), width), flat).unwrap();
    RawOutput::from(tensor.into_dyn())
  }

  /// 每个内层切片是一个检测，转置为 `[1, features, N]`
  fn columns(detections: &[&[f32]]) -> RawOutput {
    let features = detections[0].len();
    let mut tensor = Array3::<f32>::zeros((1, features, detections.len()));
    for (n, det) in detections.iter().enumerate() {
      for (f, value) in det.iter().enumerate() {
        tensor[[0, f, n]] = *value;
      }
    }
    RawOutput::from(tensor.into_dyn())
  }

  fn thresholds(conf: f32, class: f32) -> Thresholds {
    Thresholds {
      iou: 0.5,
      conf,
      class,
    }
  }

  fn run(
    variant: ModelVariant,
    output: &RawOutput,
    t: &Thresholds,
    width: f32,
    height: f32,
  ) -> Result<Vec<Candidate>, DecodeError> {
    decode(variant, output, t, width, height, None)
  }

  #[test]
  fn v5_row_multiplies_objectness_and_class_score() {
    let output = rows(&[&[0.5, 0.5, 0.2, 0.2, 0.9, 0.8, 0.1]]);
    let candidates = run(ModelVariant::V5, &output, &thresholds(0.5, 0.3), 100.0, 100.0).unwrap();
    assert_eq!(candidates.len(), 1);
    assert!((candidates[0].score - 0.72).abs() < 1e-6);
    assert_eq!(candidates[0].class_index, 0);
    assert_box(candidates[0].bbox, [40.0, 40.0, 60.0, 60.0]);
  }

  #[test]
  fn v5_objectness_gate_is_inclusive() {
    let output = rows(&[
      &[0.5, 0.5, 0.2, 0.2, 0.49, 1.0, 0.0],
      &[0.5, 0.5, 0.2, 0.2, 0.5, 1.0, 0.0],
    ]);
    let candidates = run(ModelVariant::V5, &output, &thresholds(0.5, 0.3), 100.0, 100.0).unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].anchor, 1);
  }

  #[test]
  fn class_threshold_is_strict() {
    let output = columns(&[&[0.5, 0.5, 0.2, 0.2, 0.5, 0.1]]);
    let candidates = run(ModelVariant::V8, &output, &thresholds(0.0, 0.5), 100.0, 100.0).unwrap();
    assert!(candidates.is_empty());
  }

  #[test]
  fn v8_transposed_layout_matches_v5_row() {
    let v5 = rows(&[&[0.3, 0.6, 0.2, 0.4, 0.9, 0.1, 0.8, 0.05]]);
    let v8 = columns(&[
      &[0.9, 0.9, 0.1, 0.1, 0.2, 0.1, 0.3],
      &[0.3, 0.6, 0.2, 0.4, 0.09, 0.72, 0.045],
    ]);
    let t = thresholds(0.5, 0.3);
    let a = decode(ModelVariant::V5, &v5, &t, 320.0, 240.0, Some(3)).unwrap();
    let b = decode(ModelVariant::V8, &v8, &t, 320.0, 240.0, Some(3)).unwrap();
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    assert_eq!(a[0].class_index, b[0].class_index);
    assert_eq!(a[0].class_index, 1);
    assert!((a[0].score - b[0].score).abs() < 1e-6);
    assert_box(a[0].bbox, b[0].bbox);
    assert_eq!(b[0].anchor, 1);
  }

  #[test]
  fn ties_keep_first_class() {
    let output = columns(&[&[0.5, 0.5, 0.1, 0.1, 0.7, 0.9, 0.9, 0.2]]);
    let candidates = run(ModelVariant::V8, &output, &thresholds(0.0, 0.5), 10.0, 10.0).unwrap();
    assert_eq!(candidates[0].class_index, 1);
  }

  #[test]
  fn v11_clamps_origin_only() {
    let det: &[f32] = &[0.05, 0.05, 0.2, 0.2, 0.9];
    let t = thresholds(0.0, 0.5);
    let v8 = run(ModelVariant::V8, &columns(&[det]), &t, 100.0, 100.0).unwrap();
    let v11 = run(ModelVariant::V11, &columns(&[det]), &t, 100.0, 100.0).unwrap();
    assert_box(v8[0].bbox, [-5.0, -5.0, 15.0, 15.0]);
    assert_box(v11[0].bbox, [0.0, 0.0, 15.0, 15.0]);
  }

  #[test]
  fn anisotropic_input_scales_each_axis() {
    let output = columns(&[&[0.5, 0.5, 1.0, 1.0, 0.9]]);
    let candidates = run(ModelVariant::V8, &output, &thresholds(0.0, 0.5), 640.0, 320.0).unwrap();
    assert_box(candidates[0].bbox, [0.0, 0.0, 640.0, 320.0]);
  }

  #[test]
  fn rejects_mismatched_shapes() {
    let t = Thresholds::default();
    let flat = RawOutput::from(ArrayD::<f32>::zeros(IxDyn(&[1, 84])));
    assert!(matches!(
      run(ModelVariant::V8, &flat, &t, 640.0, 640.0),
      Err(DecodeError::RankMismatch { expected: 3, actual: 2, .. })
    ));

    let batched = RawOutput::from(ArrayD::<f32>::zeros(IxDyn(&[2, 84, 10])));
    assert_eq!(
      run(ModelVariant::V8, &batched, &t, 640.0, 640.0),
      Err(DecodeError::BatchMismatch(2))
    );

    let narrow = RawOutput::from(ArrayD::<f32>::zeros(IxDyn(&[1, 10, 5])));
    assert!(matches!(
      run(ModelVariant::V5, &narrow, &t, 640.0, 640.0),
      Err(DecodeError::ChannelMismatch { .. })
    ));

    let boxes_only = RawOutput::from(ArrayD::<f32>::zeros(IxDyn(&[1, 4, 10])));
    assert!(matches!(
      run(ModelVariant::V11, &boxes_only, &t, 640.0, 640.0),
      Err(DecodeError::ChannelMismatch { .. })
    ));

    assert_eq!(
      run(ModelVariant::V8, &RawOutput::default(), &t, 640.0, 640.0),
      Err(DecodeError::MissingOutput)
    );
  }

  #[test]
  fn column_layouts_require_exact_class_rows() {
    let t = thresholds(0.0, 0.5);
    // 16 个类别的模型按 V8 解码
    let v8 = RawOutput::from(ArrayD::<f32>::from_elem(IxDyn(&[1, 20, 7]), 0.9));
    assert!(matches!(
      decode(ModelVariant::V8, &v8, &t, 640.0, 640.0, Some(80)),
      Err(DecodeError::ChannelMismatch { variant: ModelVariant::V8, .. })
    ));
    assert_eq!(decode(ModelVariant::V8, &v8, &t, 640.0, 640.0, Some(16)).unwrap().len(), 7);

    assert!(matches!(
      decode(ModelVariant::V11, &v8, &t, 640.0, 640.0, Some(15)),
      Err(DecodeError::ChannelMismatch { variant: ModelVariant::V11, .. })
    ));
  }

  #[test]
  fn v5_requires_exact_class_columns() {
    let t = thresholds(0.0, 0.5);
    // 转置布局被误当作 V5：每行只有 30 个值
    let v5 = RawOutput::from(ArrayD::<f32>::from_elem(IxDyn(&[1, 6, 30]), 0.9));
    assert!(matches!(
      decode(ModelVariant::V5, &v5, &t, 640.0, 640.0, Some(2)),
      Err(DecodeError::ChannelMismatch { variant: ModelVariant::V5, .. })
    ));
    assert_eq!(decode(ModelVariant::V5, &v5, &t, 640.0, 640.0, Some(25)).unwrap().len(), 6);
  }

  #[test]
  fn seg_requires_exact_class_and_coefficient_rows() {
    let t = thresholds(0.0, 0.5);
    let primary = ArrayD::<f32>::zeros(IxDyn(&[1, 4 + 2 + 3, 6]));
    let protos = ArrayD::<f32>::zeros(IxDyn(&[1, 8, 8, 3]));
    let output = RawOutput::new(vec![primary, protos]);
    assert!(decode(ModelVariant::V8Seg, &output, &t, 64.0, 64.0, Some(2)).is_ok());
    assert!(matches!(
      decode(ModelVariant::V8Seg, &output, &t, 64.0, 64.0, Some(3)),
      Err(DecodeError::ChannelMismatch { variant: ModelVariant::V8Seg, .. })
    ));
  }

  #[test]
  fn seg_requires_prototypes_and_room_for_classes() {
    let t = thresholds(0.0, 0.5);
    let primary = ArrayD::<f32>::zeros(IxDyn(&[1, 4 + 2 + 3, 6]));
    assert_eq!(
      run(ModelVariant::V8Seg, &RawOutput::from(primary.clone()), &t, 64.0, 64.0),
      Err(DecodeError::MissingPrototypes)
    );

    let protos = ArrayD::<f32>::zeros(IxDyn(&[1, 8, 8, 3]));
    let output = RawOutput::new(vec![primary, protos]);
    assert!(run(ModelVariant::V8Seg, &output, &t, 64.0, 64.0).unwrap().is_empty());

    let wide_protos = ArrayD::<f32>::zeros(IxDyn(&[1, 8, 8, 5]));
    let primary = ArrayD::<f32>::zeros(IxDyn(&[1, 9, 6]));
    let output = RawOutput::new(vec![primary, wide_protos]);
    assert!(matches!(
      run(ModelVariant::V8Seg, &output, &t, 64.0, 64.0),
      Err(DecodeError::ChannelMismatch { .. })
    ));
  }

  #[test]
  fn seg_ignores_mask_coefficients_when_picking_class() {
    let mut det = vec![0.5, 0.5, 0.5, 0.5, 0.6, 0.7];
    det.extend([5.0, 5.0]);
    let primary = columns(&[&det]).primary().cloned().unwrap();
    let protos = ArrayD::<f32>::zeros(IxDyn(&[1, 4, 4, 2]));
    let output = RawOutput::new(vec![primary, protos]);
    let candidates = run(ModelVariant::V8Seg, &output, &thresholds(0.0, 0.5), 10.0, 10.0).unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].class_index, 1);
    assert!((candidates[0].score - 0.7).abs() < 1e-6);
  }
}
