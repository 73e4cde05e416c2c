// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/model/mask.rs - 分割掩码提取
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

use ndarray::{ArrayD, ArrayView3, Axis, Ix3, s};
use tracing::debug;

use crate::model::{
  Candidate, ModelVariant, RawOutput,
  decode::{DecodeError, detection_table, seg_class_count},
};

const MASK_THRESHOLD: f32 = 0.5;

/// 二值掩码，位于原型网格坐标系，值为 0 或 255
///
/// `(x, y)` 为掩码在 `grid_width x grid_height` 原型网格中的左上角。
#[derive(Debug, Clone, PartialEq)]
pub struct SegMask {
  pub x: u32,
  pub y: u32,
  pub width: u32,
  pub height: u32,
  pub grid_width: u32,
  pub grid_height: u32,
  pub data: Box<[u8]>,
}

impl SegMask {
  pub fn get(&self, x: u32, y: u32) -> Option<u8> {
    if x >= self.width || y >= self.height {
      return None;
    }
    self
      .data
      .get(y as usize * self.width as usize + x as usize)
      .copied()
  }

  /// 前景像素数量
  pub fn area(&self) -> usize {
    self.data.iter().filter(|&&v| v != 0).count()
  }
}

/// 原型掩码张量视图，统一为 `[Mh, Mw, M]`
pub(crate) struct Prototypes<'a> {
  view: ArrayView3<'a, f32>,
}

impl<'a> Prototypes<'a> {
  /// 接受 `[1, Mh, Mw, M]`、`[1, M, Mh, Mw]` 及去掉批次维度的形式
  pub(crate) fn from_tensor(tensor: &'a ArrayD<f32>) -> Result<Self, DecodeError> {
    let invalid = || DecodeError::PrototypeShape(tensor.shape().to_vec());
    let view = match tensor.ndim() {
      4 if tensor.shape()[0] == 1 => tensor.index_axis(Axis(0), 0),
      3 => tensor.view(),
      _ => return Err(invalid()),
    };
    let view = view.into_dimensionality::<Ix3>().map_err(|_| invalid())?;

    let (a, _, c) = view.dim();
    // 系数个数远小于网格边长，据此判断通道位置
    let view = if c <= a {
      view
    } else {
      view.permuted_axes([1, 2, 0])
    };

    let (h, w, m) = view.dim();
    if h == 0 || w == 0 || m == 0 {
      return Err(invalid());
    }
    Ok(Self { view })
  }

  pub(crate) fn channels(&self) -> usize {
    self.view.dim().2
  }

  fn grid(&self) -> (usize, usize) {
    let (h, w, _) = self.view.dim();
    (w, h)
  }
}

/// 为 NMS 后保留的检测生成掩码，顺序与 `survivors` 一致
pub fn extract_masks(
  output: &RawOutput,
  survivors: &[Candidate],
  input_width: f32,
  input_height: f32,
) -> Result<Vec<SegMask>, DecodeError> {
  let tensor = output.primary().ok_or(DecodeError::MissingOutput)?;
  let table = detection_table(ModelVariant::V8Seg, tensor)?;
  let prototypes = output.prototypes().ok_or(DecodeError::MissingPrototypes)?;
  let prototypes = Prototypes::from_tensor(prototypes)?;
  let coefficients = prototypes.channels();
  let classes = seg_class_count(table.nrows(), coefficients)?;
  let start = 4 + classes;

  let (grid_width, grid_height) = prototypes.grid();
  let scale_x = grid_width as f32 / input_width;
  let scale_y = grid_height as f32 / input_height;
  debug!(
    "原型网格: {}x{}, 系数个数: {}",
    grid_width, grid_height, coefficients
  );

  let mut masks = Vec::with_capacity(survivors.len());
  for candidate in survivors {
    if candidate.anchor >= table.ncols() {
      return Err(DecodeError::ChannelMismatch {
        variant: ModelVariant::V8Seg,
        detail: format!("检测序号 {} 超出范围 {}", candidate.anchor, table.ncols()),
      });
    }
    let coeffs = table.slice(s![start..start + coefficients, candidate.anchor]);

    let [x1, y1, x2, y2] = candidate.bbox;
    let (x, x_end) = grid_span(x1 * scale_x, x2 * scale_x, grid_width);
    let (y, y_end) = grid_span(y1 * scale_y, y2 * scale_y, grid_height);

    let mut data = Vec::with_capacity((x_end - x) * (y_end - y));
    for gy in y..y_end {
      for gx in x..x_end {
        let logit = prototypes.view.slice(s![gy, gx, ..]).dot(&coeffs);
        data.push(if sigmoid(logit) > MASK_THRESHOLD { 255 } else { 0 });
      }
    }

    masks.push(SegMask {
      x: x as u32,
      y: y as u32,
      width: (x_end - x) as u32,
      height: (y_end - y) as u32,
      grid_width: grid_width as u32,
      grid_height: grid_height as u32,
      data: data.into_boxed_slice(),
    });
  }
  Ok(masks)
}

/// 起点截断到网格内，终点至少比起点多一格，结果永不为空
fn grid_span(start: f32, end: f32, size: usize) -> (usize, usize) {
  let max = size as i64;
  let begin = (start as i64).clamp(0, max - 1);
  let end = (end as i64).min(max).max(begin + 1);
  (begin as usize, end as usize)
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
