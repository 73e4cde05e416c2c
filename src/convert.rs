// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/convert.rs - YUV 4:2:0 到 RGBA 的颜色转换
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

//! 相机帧颜色转换
//!
//! 三个平面先按 `Y ++ V ++ U` 的固定顺序拼接，再交给 `yuv` 按 BT.601
//! 有限范围（video range）矩阵批量转换为 RGBA。色度部分有两种解释方式：
//!
//! - V 平面足够容纳交错的 VU 样本时按 NV21 半平面读取，相机输出的
//!   像素跨度为 2 的色度平面就是这种情况；
//! - 否则按 YV12 全平面读取，V 平面在前，U 平面在后。

use image::{RgbaImage, imageops};
use thiserror::Error;
use tracing::{debug, error, warn};
use yuv::{
  YuvBiPlanarImage, YuvConversionMode, YuvError, YuvPlanarImage, YuvRange, YuvStandardMatrix,
};

use crate::frame::{PixelBuffer, PlanarFrame, Rotation};

#[derive(Error, Debug)]
pub enum ConversionError {
  #[error("缺少 {0} 平面")]
  MissingPlane(&'static str),
  #[error("{plane} 平面过短: 期望至少 {expected} 字节, 实际 {actual} 字节")]
  PlaneTooShort {
    plane: &'static str,
    expected: usize,
    actual: usize,
  },
  #[error("帧尺寸无效: {width}x{height}")]
  InvalidDimensions { width: u32, height: u32 },
  #[error("图像解码错误: {0}")]
  ImageDecode(#[from] image::ImageError),
  #[error("像素格式转换错误: {0}")]
  PixelFormat(#[from] YuvError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChromaLayout {
  /// VUVU... 交错，NV21
  Interleaved,
  /// V 平面后接 U 平面，YV12
  Planar,
}

/// 按 `Y ++ V ++ U` 拼接三个平面，不插入任何填充
pub fn reassemble_planes(y: &[u8], u: &[u8], v: &[u8]) -> Vec<u8> {
  let mut combined = Vec::with_capacity(y.len() + u.len() + v.len());
  combined.extend_from_slice(y);
  combined.extend_from_slice(v);
  combined.extend_from_slice(u);
  combined
}

/// 解码 PNG/JPEG 等编码图像为 RGBA 像素缓冲
///
/// 可用的格式取决于 `read_image_file` 特性。
pub fn decode_image(bytes: &[u8]) -> Result<PixelBuffer, ConversionError> {
  let image = image::load_from_memory(bytes).map_err(|e| {
    error!("图像解码失败: {}", e);
    e
  })?;
  debug!("解码图像: {}x{}", image.width(), image.height());
  Ok(PixelBuffer::from(image.to_rgba8()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ColorConverter;

impl ColorConverter {
  pub fn new() -> Self {
    Self
  }

  pub fn convert(&self, frame: &PlanarFrame) -> Result<PixelBuffer, ConversionError> {
    let (width, height) = (frame.width(), frame.height());
    if width == 0 || height == 0 {
      error!("帧尺寸无效: {}x{}", width, height);
      return Err(ConversionError::InvalidDimensions { width, height });
    }

    let y = frame.y().ok_or(ConversionError::MissingPlane("Y"))?;
    let u = frame.u().ok_or(ConversionError::MissingPlane("U"))?;
    let v = frame.v().ok_or(ConversionError::MissingPlane("V"))?;
    debug!("YUV 平面大小: Y={}, U={}, V={}", y.len(), u.len(), v.len());

    let luma_len = width as usize * height as usize;
    if y.len() < luma_len {
      error!("Y 平面过短: 期望 {}, 实际 {}", luma_len, y.len());
      return Err(ConversionError::PlaneTooShort {
        plane: "Y",
        expected: luma_len,
        actual: y.len(),
      });
    }
    if y.len() != luma_len {
      warn!("Y 平面大小不一致: 期望 {}, 实际 {}", luma_len, y.len());
    }

    let layout = chroma_layout(width, height, u, v)?;
    debug!("色度排列: {:?}", layout);

    let combined = reassemble_planes(y, u, v);
    let rgba = yuv420_to_rgba(&combined, width, height, y.len(), v.len(), layout)?;
    drop(combined);

    let image = RgbaImage::from_raw(width, height, rgba).ok_or(
      ConversionError::InvalidDimensions { width, height },
    )?;
    let oriented = rotate(image, frame.rotation());
    if frame.rotation() != Rotation::Deg0 {
      debug!("已应用旋转: {} 度", frame.rotation());
    }

    Ok(PixelBuffer::from(oriented))
  }
}

fn chroma_layout(
  width: u32,
  height: u32,
  u: &[u8],
  v: &[u8],
) -> Result<ChromaLayout, ConversionError> {
  let chroma_samples = chroma_width(width) * chroma_height(height);
  if v.len() >= 2 * chroma_samples - 1 {
    return Ok(ChromaLayout::Interleaved);
  }
  if v.len() < chroma_samples {
    return Err(ConversionError::PlaneTooShort {
      plane: "V",
      expected: chroma_samples,
      actual: v.len(),
    });
  }
  if u.len() < chroma_samples {
    return Err(ConversionError::PlaneTooShort {
      plane: "U",
      expected: chroma_samples,
      actual: u.len(),
    });
  }
  Ok(ChromaLayout::Planar)
}

fn chroma_width(width: u32) -> usize {
  (width as usize).div_ceil(2)
}

fn chroma_height(height: u32) -> usize {
  (height as usize).div_ceil(2)
}

/// `combined` 中 Y 平面占前 `luma_len` 字节，色度从其后开始
fn yuv420_to_rgba(
  combined: &[u8],
  width: u32,
  height: u32,
  luma_len: usize,
  v_len: usize,
  layout: ChromaLayout,
) -> Result<Vec<u8>, ConversionError> {
  let (w, h) = (width as usize, height as usize);
  let cw = chroma_width(width);
  let chroma = cw * chroma_height(height);
  let y_plane = &combined[..w * h];
  let mut rgba = vec![0u8; w * h * 4];

  match layout {
    ChromaLayout::Interleaved => {
      // 最后一个 U 样本落在 V 平面之后，由拼接的 U 平面首字节补齐
      let end = luma_len + 2 * chroma;
      let uv_plane = combined
        .get(luma_len..end)
        .ok_or(ConversionError::PlaneTooShort {
          plane: "V",
          expected: 2 * chroma,
          actual: combined.len().saturating_sub(luma_len),
        })?;
      let image = YuvBiPlanarImage {
        y_plane,
        y_stride: width,
        uv_plane,
        uv_stride: (2 * cw) as u32,
        width,
        height,
      };
      yuv::yuv_nv21_to_rgba(
        &image,
        &mut rgba,
        width * 4,
        YuvRange::Limited,
        YuvStandardMatrix::Bt601,
        YuvConversionMode::Balanced,
      )?;
    }
    ChromaLayout::Planar => {
      let u_start = luma_len + v_len;
      let image = YuvPlanarImage {
        y_plane,
        y_stride: width,
        u_plane: &combined[u_start..u_start + chroma],
        u_stride: cw as u32,
        v_plane: &combined[luma_len..luma_len + chroma],
        v_stride: cw as u32,
        width,
        height,
      };
      yuv::yuv420_to_rgba(
        &image,
        &mut rgba,
        width * 4,
        YuvRange::Limited,
        YuvStandardMatrix::Bt601,
      )?;
    }
  }

  Ok(rgba)
}

fn rotate(image: RgbaImage, rotation: Rotation) -> RgbaImage {
  match rotation {
    Rotation::Deg0 => image,
    Rotation::Deg90 => imageops::rotate90(&image),
    Rotation::Deg180 => imageops::rotate180(&image),
    Rotation::Deg270 => imageops::rotate270(&image),
  }
}
