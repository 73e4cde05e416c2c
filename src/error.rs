// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/error.rs - 流水线错误定义
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

use thiserror::Error;

use crate::{
  convert::ConversionError,
  model::{InferenceError, LabelError, SUPPORTED_VERSIONS, decode::DecodeError},
};

/// 参数校验错误，在触及任何缓冲或推理句柄之前返回
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
  #[error("缺少必要参数: {0}")]
  MissingArgument(&'static str),
  #[error("参数 {0} 无效: '{1}'")]
  InvalidArgument(&'static str, String),
  #[error("尺寸无效: {width}x{height}")]
  InvalidDimensions { width: u32, height: u32 },
  #[error("缩放策略无效: '{0}'，必须为 'downsize' 或 'upsize'")]
  InvalidStrategy(String),
  #[error("不支持的旋转角度: {0}")]
  InvalidRotation(i32),
  #[error("不支持的模型版本: {0}，支持的版本: {versions}", versions = SUPPORTED_VERSIONS)]
  UnsupportedVersion(String),
  #[error("不支持的输入张量维度数: {0}")]
  UnsupportedTensorRank(usize),
  #[error("输入张量通道数必须为 3, 实际为 {0}")]
  UnsupportedChannels(usize),
  #[error("归一化参数无效: mean={mean}, std={std}")]
  InvalidNormalization { mean: f32, std: f32 },
  #[error("像素缓冲无效: {0}")]
  InvalidPixelBuffer(String),
}

/// 单次请求的失败，按阶段区分
#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("参数校验失败: {0}")]
  Validation(#[from] ValidationError),
  #[error("帧转换失败: {0}")]
  Conversion(#[from] ConversionError),
  #[error("输出解码失败: {0}")]
  Decode(#[from] DecodeError),
  #[error("推理失败: {0}")]
  Inference(#[from] InferenceError),
  #[error("标签加载失败: {0}")]
  Label(#[from] LabelError),
  #[error("模型未加载")]
  ModelNotLoaded,
  #[error("工作线程启动失败: {0}")]
  WorkerSpawn(std::io::Error),
  #[error("工作线程已退出")]
  WorkerGone,
}
