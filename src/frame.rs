// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/frame.rs - 传感器帧与像素缓冲定义
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

use image::{RgbImage, RgbaImage};

use crate::error::ValidationError;

const RGBA_CHANNELS: usize = 4;

/// 帧的顺时针旋转角度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
  #[default]
  Deg0,
  Deg90,
  Deg180,
  Deg270,
}

impl Rotation {
  pub fn degrees(self) -> u16 {
    match self {
      Rotation::Deg0 => 0,
      Rotation::Deg90 => 90,
      Rotation::Deg180 => 180,
      Rotation::Deg270 => 270,
    }
  }
}

impl TryFrom<i32> for Rotation {
  type Error = ValidationError;

  fn try_from(degrees: i32) -> Result<Self, Self::Error> {
    match degrees {
      0 => Ok(Rotation::Deg0),
      90 => Ok(Rotation::Deg90),
      180 => Ok(Rotation::Deg180),
      270 => Ok(Rotation::Deg270),
      other => Err(ValidationError::InvalidRotation(other)),
    }
  }
}

impl FromStr for Rotation {
  type Err = ValidationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let degrees = s
      .trim()
      .parse::<i32>()
      .map_err(|_| ValidationError::InvalidArgument("rotation", s.to_string()))?;
    Rotation::try_from(degrees)
  }
}

impl std::fmt::Display for Rotation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.degrees())
  }
}

/// 相机传感器输出的三平面 YUV 4:2:0 帧
///
/// 平面按 Y、U、V 的自然顺序存放。Y 平面长度通常等于 `width * height`，
/// 传感器行填充导致的不一致只记录警告。
#[derive(Debug, Clone)]
pub struct PlanarFrame {
  planes: Vec<Vec<u8>>,
  width: u32,
  height: u32,
  rotation: Rotation,
}

impl PlanarFrame {
  pub fn new(planes: Vec<Vec<u8>>, width: u32, height: u32, rotation: Rotation) -> Self {
    Self {
      planes,
      width,
      height,
      rotation,
    }
  }

  pub fn from_yuv(y: Vec<u8>, u: Vec<u8>, v: Vec<u8>, width: u32, height: u32) -> Self {
    Self::new(vec![y, u, v], width, height, Rotation::Deg0)
  }

  pub fn with_rotation(mut self, rotation: Rotation) -> Self {
    self.rotation = rotation;
    self
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn rotation(&self) -> Rotation {
    self.rotation
  }

  /// 拆分为平面、宽、高与旋转角度
  pub fn into_parts(self) -> (Vec<Vec<u8>>, u32, u32, Rotation) {
    (self.planes, self.width, self.height, self.rotation)
  }

  fn plane(&self, index: usize) -> Option<&[u8]> {
    self
      .planes
      .get(index)
      .map(Vec::as_slice)
      .filter(|p| !p.is_empty())
  }

  pub fn y(&self) -> Option<&[u8]> {
    self.plane(0)
  }

  pub fn u(&self) -> Option<&[u8]> {
    self.plane(1)
  }

  pub fn v(&self) -> Option<&[u8]> {
    self.plane(2)
  }
}

/// 交错排列的 RGBA 8 位像素缓冲
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PixelBuffer {
  width: u32,
  height: u32,
  data: Box<[u8]>,
}

impl PixelBuffer {
  pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self, ValidationError> {
    let expected = RGBA_CHANNELS * width as usize * height as usize;
    if data.len() != expected {
      return Err(ValidationError::InvalidPixelBuffer(format!(
        "数据长度不匹配: 期望长度 {}, 实际长度 {}",
        expected,
        data.len()
      )));
    }

    Ok(Self {
      width,
      height,
      data: data.into_boxed_slice(),
    })
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn is_empty(&self) -> bool {
    self.width == 0 || self.height == 0
  }

  pub fn as_rgba(&self) -> &[u8] {
    &self.data
  }

  pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
    if x >= self.width || y >= self.height {
      return None;
    }
    let idx = (y as usize * self.width as usize + x as usize) * RGBA_CHANNELS;
    let p = &self.data[idx..idx + RGBA_CHANNELS];
    Some([p[0], p[1], p[2], p[3]])
  }

  /// 丢弃 alpha 通道，得到紧凑的 RGB 图像
  pub fn to_rgb_image(&self) -> RgbImage {
    let width = self.width as usize;
    RgbImage::from_fn(self.width, self.height, |x, y| {
      let idx = (y as usize * width + x as usize) * RGBA_CHANNELS;
      image::Rgb([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    })
  }
}

impl From<RgbaImage> for PixelBuffer {
  fn from(image: RgbaImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      width,
      height,
      data: image.into_raw().into_boxed_slice(),
    }
  }
}
