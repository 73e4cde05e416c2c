// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/preprocess.rs - 输入张量预处理
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

use std::{
  str::FromStr,
  sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicUsize, Ordering},
  },
};

use image::{RgbImage, imageops::FilterType};
use ndarray::{Array4, ArrayD, IxDyn};
use tracing::{debug, error};

use crate::{error::ValidationError, frame::PixelBuffer};

const RGB_CHANNELS: usize = 3;

/// 缩放策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeStrategy {
  /// 双线性缩放到目标尺寸，不保持宽高比
  Downsize,
  /// 原尺寸居中裁剪或补零，不放大
  Upsize,
}

impl ResizeStrategy {
  /// 任一边超过目标尺寸时缩小，否则（含相等）居中补齐
  pub fn select(
    source_width: u32,
    source_height: u32,
    target_width: u32,
    target_height: u32,
  ) -> Self {
    if source_width > target_width || source_height > target_height {
      ResizeStrategy::Downsize
    } else {
      ResizeStrategy::Upsize
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      ResizeStrategy::Downsize => "downsize",
      ResizeStrategy::Upsize => "upsize",
    }
  }
}

impl FromStr for ResizeStrategy {
  type Err = ValidationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "downsize" => Ok(ResizeStrategy::Downsize),
      "upsize" => Ok(ResizeStrategy::Upsize),
      other => Err(ValidationError::InvalidStrategy(other.to_string())),
    }
  }
}

/// 预处理流水线的缓存键
///
/// 浮点字段按位比较，`-0.0` 与 `0.0` 视为不同的键。
#[derive(Debug, Clone, Copy)]
pub struct PreprocessConfig {
  pub target_width: u32,
  pub target_height: u32,
  pub mean: f32,
  pub std: f32,
}

impl PartialEq for PreprocessConfig {
  fn eq(&self, other: &Self) -> bool {
    self.target_width == other.target_width
      && self.target_height == other.target_height
      && self.mean.to_bits() == other.mean.to_bits()
      && self.std.to_bits() == other.std.to_bits()
  }
}

impl Eq for PreprocessConfig {}

impl PreprocessConfig {
  fn validate(&self) -> Result<(), ValidationError> {
    if self.target_width == 0 || self.target_height == 0 {
      return Err(ValidationError::InvalidDimensions {
        width: self.target_width,
        height: self.target_height,
      });
    }
    if !self.mean.is_finite() || !self.std.is_finite() || self.std == 0.0 {
      return Err(ValidationError::InvalidNormalization {
        mean: self.mean,
        std: self.std,
      });
    }
    Ok(())
  }
}

/// 模型声明的输入形状，通道在最后
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputGeometry {
  pub width: u32,
  pub height: u32,
  /// 4 维 `[1, H, W, 3]`，否则为 3 维 `[H, W, 3]`
  pub batched: bool,
}

impl InputGeometry {
  pub fn from_shape(shape: &[usize]) -> Result<Self, ValidationError> {
    let (height, width, channels, batched) = match *shape {
      [h, w, c] => (h, w, c, false),
      [_, h, w, c] => (h, w, c, true),
      _ => return Err(ValidationError::UnsupportedTensorRank(shape.len())),
    };
    if channels != RGB_CHANNELS {
      return Err(ValidationError::UnsupportedChannels(channels));
    }
    if width == 0 || height == 0 {
      return Err(ValidationError::InvalidDimensions {
        width: width as u32,
        height: height as u32,
      });
    }
    Ok(Self {
      width: width as u32,
      height: height as u32,
      batched,
    })
  }
}

/// 模型输入张量，float32，通道在最后
#[derive(Debug, Clone)]
pub struct InputTensor {
  data: ArrayD<f32>,
}

impl InputTensor {
  pub fn shape(&self) -> &[usize] {
    self.data.shape()
  }

  pub fn view(&self) -> ndarray::ArrayViewD<'_, f32> {
    self.data.view()
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  /// 按模型声明的维度数调整形状
  pub fn conform(self, geometry: &InputGeometry) -> Result<Self, ValidationError> {
    if geometry.batched || self.data.ndim() == 3 {
      return Ok(self);
    }
    let shape = self.data.shape()[1..].to_vec();
    // 去掉长度为 1 的批次维度不会改变元素顺序
    let data = self
      .data
      .into_shape_with_order(IxDyn(&shape))
      .map_err(|e| {
        error!("输入张量变形失败: {}", e);
        ValidationError::InvalidArgument("input_tensor", format!("{:?}: {}", shape, e))
      })?;
    Ok(Self { data })
  }
}

#[derive(Debug, Clone, Copy)]
enum ResizeOp {
  Bilinear { width: u32, height: u32 },
  CropOrPad { width: u32, height: u32 },
}

impl ResizeOp {
  fn apply(&self, image: &RgbImage) -> RgbImage {
    match *self {
      ResizeOp::Bilinear { width, height } => {
        image::imageops::resize(image, width, height, FilterType::Triangle)
      }
      ResizeOp::CropOrPad { width, height } => crop_or_pad(image, width, height),
    }
  }
}

/// 每个轴独立处理：源大于目标时居中裁剪，否则居中放置并补零
fn crop_or_pad(image: &RgbImage, width: u32, height: u32) -> RgbImage {
  let (src_w, src_h) = image.dimensions();
  let (src_x, dst_x, copy_w) = axis_window(src_w, width);
  let (src_y, dst_y, copy_h) = axis_window(src_h, height);

  let mut out = RgbImage::new(width, height);
  for y in 0..copy_h {
    for x in 0..copy_w {
      let pixel = *image.get_pixel(src_x + x, src_y + y);
      out.put_pixel(dst_x + x, dst_y + y, pixel);
    }
  }
  out
}

fn axis_window(source: u32, target: u32) -> (u32, u32, u32) {
  if source > target {
    ((source - target) / 2, 0, target)
  } else {
    (0, (target - source) / 2, source)
  }
}

#[derive(Debug, Clone, Copy)]
struct NormalizeOp {
  mean: f32,
  std: f32,
}

impl NormalizeOp {
  fn apply(&self, value: f32) -> f32 {
    (value - self.mean) / self.std
  }
}

/// 缩放与归一化算子对，按配置构建一次后复用
#[derive(Debug)]
struct Pipeline {
  config: PreprocessConfig,
  downsize: ResizeOp,
  upsize: ResizeOp,
  normalize: NormalizeOp,
}

impl Pipeline {
  fn new(config: PreprocessConfig) -> Self {
    let (width, height) = (config.target_width, config.target_height);
    debug!(
      "构建预处理流水线: {}x{}, mean={:.2}, std={:.2}",
      width, height, config.mean, config.std
    );
    Self {
      config,
      downsize: ResizeOp::Bilinear { width, height },
      upsize: ResizeOp::CropOrPad { width, height },
      normalize: NormalizeOp {
        mean: config.mean,
        std: config.std,
      },
    }
  }

  fn process(&self, pixels: &PixelBuffer, strategy: ResizeStrategy) -> InputTensor {
    let rgb = pixels.to_rgb_image();
    let resized = match strategy {
      ResizeStrategy::Downsize => self.downsize.apply(&rgb),
      ResizeStrategy::Upsize => self.upsize.apply(&rgb),
    };
    drop(rgb);

    let (width, height) = (
      self.config.target_width as usize,
      self.config.target_height as usize,
    );
    let mut tensor = Array4::<f32>::zeros((1, height, width, RGB_CHANNELS));
    for (x, y, pixel) in resized.enumerate_pixels() {
      for c in 0..RGB_CHANNELS {
        tensor[[0, y as usize, x as usize, c]] = self.normalize.apply(pixel[c] as f32);
      }
    }

    InputTensor {
      data: tensor.into_dyn(),
    }
  }
}

/// 将像素缓冲转换为模型输入张量
///
/// 流水线按 [`PreprocessConfig`] 缓存，键变化时在写锁内二次检查后重建。
#[derive(Debug, Default)]
pub struct TensorPreprocessor {
  cache: RwLock<Option<Arc<Pipeline>>>,
  builds: AtomicUsize,
}

impl TensorPreprocessor {
  pub fn new() -> Self {
    Self::default()
  }

  /// 流水线构建次数
  pub fn pipeline_builds(&self) -> usize {
    self.builds.load(Ordering::Relaxed)
  }

  fn pipeline(&self, config: PreprocessConfig) -> Arc<Pipeline> {
    {
      let cached = self.cache.read().unwrap_or_else(PoisonError::into_inner);
      if let Some(pipeline) = cached.as_ref().filter(|p| p.config == config) {
        return Arc::clone(pipeline);
      }
    }

    let mut cached = self.cache.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(pipeline) = cached.as_ref().filter(|p| p.config == config) {
      return Arc::clone(pipeline);
    }
    if cached.is_some() {
      debug!("预处理参数变化，重建流水线");
    }
    let pipeline = Arc::new(Pipeline::new(config));
    *cached = Some(Arc::clone(&pipeline));
    self.builds.fetch_add(1, Ordering::Relaxed);
    pipeline
  }

  /// 按指定策略生成 `[1, H, W, 3]` 张量
  pub fn prepare(
    &self,
    pixels: &PixelBuffer,
    target_width: u32,
    target_height: u32,
    mean: f32,
    std: f32,
    strategy: ResizeStrategy,
  ) -> Result<InputTensor, ValidationError> {
    if pixels.is_empty() {
      error!("像素缓冲为空: {}x{}", pixels.width(), pixels.height());
      return Err(ValidationError::InvalidPixelBuffer(format!(
        "像素缓冲为空: {}x{}",
        pixels.width(),
        pixels.height()
      )));
    }

    let config = PreprocessConfig {
      target_width,
      target_height,
      mean,
      std,
    };
    config.validate()?;

    debug!(
      "预处理: {}x{} -> {}x{}, 模式: {}",
      pixels.width(),
      pixels.height(),
      target_width,
      target_height,
      strategy.as_str()
    );

    let tensor = self.pipeline(config).process(pixels, strategy);
    debug!("预处理张量形状: {:?}", tensor.shape());
    Ok(tensor)
  }

  /// 使用字符串形式的策略，仅接受 `downsize` 与 `upsize`
  pub fn prepare_with(
    &self,
    pixels: &PixelBuffer,
    target_width: u32,
    target_height: u32,
    mean: f32,
    std: f32,
    strategy: &str,
  ) -> Result<InputTensor, ValidationError> {
    let strategy = strategy.parse::<ResizeStrategy>()?;
    self.prepare(pixels, target_width, target_height, mean, std, strategy)
  }

  /// 根据源尺寸与目标尺寸自动选择策略
  pub fn prepare_auto(
    &self,
    pixels: &PixelBuffer,
    target_width: u32,
    target_height: u32,
    mean: f32,
    std: f32,
  ) -> Result<InputTensor, ValidationError> {
    let strategy =
      ResizeStrategy::select(pixels.width(), pixels.height(), target_width, target_height);
    self.prepare(pixels, target_width, target_height, mean, std, strategy)
  }
}

/// 归一化的逆运算
pub fn denormalize(value: f32, mean: f32, std: f32) -> f32 {
  value * std + mean
}
