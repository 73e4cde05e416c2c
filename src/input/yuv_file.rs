// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/input/yuv_file.rs - 原始 YUV 帧文件输入
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

use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{PlanarFrame, Rotation},
  query_value,
};

#[derive(Error, Debug)]
pub enum YuvFileInputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("缺少参数: {0}")]
  MissingArgument(&'static str),
  #[error("参数 {0} 无效: {1}")]
  InvalidArgument(&'static str, String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("文件过短: 一帧需要 {expected} 字节, 文件只有 {actual} 字节")]
  TooShort { expected: usize, actual: usize },
}

/// 文件中每帧的字节排列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum YuvLayout {
  /// Y 平面后接 U 平面与 V 平面
  #[default]
  I420,
  /// Y 平面后接 VU 交错的色度平面
  Nv21,
}

impl FromStr for YuvLayout {
  type Err = YuvFileInputError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "i420" => Ok(YuvLayout::I420),
      "nv21" => Ok(YuvLayout::Nv21),
      other => Err(YuvFileInputError::InvalidArgument("format", other.to_string())),
    }
  }
}

/// 从原始 YUV 文件中逐帧读取，`loop` 参数使其循环回放
///
/// URL 形式为 `yuv:///path?width=640&height=480&rotation=90&format=nv21&loop`。
pub struct YuvFileInput {
  data: Vec<u8>,
  width: u32,
  height: u32,
  rotation: Option<Rotation>,
  layout: YuvLayout,
  cursor: usize,
  looping: bool,
}

impl FromUrlWithScheme for YuvFileInput {
  const SCHEME: &'static str = "yuv";
}

fn required<T: FromStr>(url: &Url, key: &'static str) -> Result<T, YuvFileInputError>
where
  T::Err: std::fmt::Display,
{
  query_value::<T>(url, key)
    .map_err(|e| YuvFileInputError::InvalidArgument(key, e.to_string()))?
    .ok_or(YuvFileInputError::MissingArgument(key))
}

impl FromUrl for YuvFileInput {
  type Error = YuvFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(YuvFileInputError::SchemeMismatch(url.scheme().to_string()));
    }

    let width = required::<u32>(url, "width")?;
    let height = required::<u32>(url, "height")?;
    let rotation = query_value::<Rotation>(url, "rotation")
      .map_err(|e| YuvFileInputError::InvalidArgument("rotation", e.to_string()))?;
    let layout = query_value::<YuvLayout>(url, "format")?.unwrap_or_default();
    let looping = url.query_pairs().any(|(k, _)| k == "loop");

    let data = std::fs::read(url.path())?;
    info!(
      "读取 YUV 文件 {}: {}x{}, {:?}, {} 字节",
      url.path(),
      width,
      height,
      layout,
      data.len()
    );
    let input = Self::new(data, width, height, layout)?.with_looping(looping);
    Ok(match rotation {
      Some(rotation) => input.with_rotation(rotation),
      None => input,
    })
  }
}

impl YuvFileInput {
  pub fn new(
    data: Vec<u8>,
    width: u32,
    height: u32,
    layout: YuvLayout,
  ) -> Result<Self, YuvFileInputError> {
    if width == 0 || height == 0 {
      return Err(YuvFileInputError::InvalidArgument(
        "width/height",
        format!("{}x{}", width, height),
      ));
    }
    let expected = frame_size(width, height);
    if data.len() < expected {
      return Err(YuvFileInputError::TooShort {
        expected,
        actual: data.len(),
      });
    }
    if data.len() % expected != 0 {
      warn!("文件末尾有 {} 字节不足一帧，将被忽略", data.len() % expected);
    }

    Ok(Self {
      data,
      width,
      height,
      rotation: None,
      layout,
      cursor: 0,
      looping: false,
    })
  }

  pub fn with_rotation(mut self, rotation: Rotation) -> Self {
    self.rotation = Some(rotation);
    self
  }

  /// URL 中显式指定的旋转角度，未指定时由检测器的配置决定
  pub fn rotation(&self) -> Option<Rotation> {
    self.rotation
  }

  pub fn with_looping(mut self, looping: bool) -> Self {
    self.looping = looping;
    self
  }

  pub fn frame_count(&self) -> usize {
    self.data.len() / frame_size(self.width, self.height)
  }

  fn split(&self, frame: &[u8]) -> PlanarFrame {
    let luma = self.width as usize * self.height as usize;
    let chroma = chroma_samples(self.width, self.height);
    let (y, rest) = frame.split_at(luma);
    let (u, v) = match self.layout {
      YuvLayout::I420 => (rest[..chroma].to_vec(), rest[chroma..2 * chroma].to_vec()),
      // V 平面起始于第一个 V 样本，U 平面起始于第一个 U 样本，像素跨度均为 2
      YuvLayout::Nv21 => (rest[1..2 * chroma].to_vec(), rest[..2 * chroma].to_vec()),
    };
    PlanarFrame::from_yuv(y.to_vec(), u, v, self.width, self.height)
      .with_rotation(self.rotation.unwrap_or_default())
  }
}

impl Iterator for YuvFileInput {
  type Item = PlanarFrame;

  fn next(&mut self) -> Option<Self::Item> {
    let size = frame_size(self.width, self.height);
    if self.cursor + size > self.data.len() {
      if !self.looping {
        return None;
      }
      debug!("YUV 文件读取完毕，从头回放");
      self.cursor = 0;
    }
    let frame = self.split(&self.data[self.cursor..self.cursor + size]);
    self.cursor += size;
    Some(frame)
  }
}

fn chroma_samples(width: u32, height: u32) -> usize {
  (width as usize).div_ceil(2) * (height as usize).div_ceil(2)
}

fn frame_size(width: u32, height: u32) -> usize {
  width as usize * height as usize + 2 * chroma_samples(width, height)
}
