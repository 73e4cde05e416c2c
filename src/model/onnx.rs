// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 推理后端
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

use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use ort::{
  inputs,
  session::{Session, builder::GraphOptimizationLevel},
  value::{Tensor, ValueType},
};
use tracing::{debug, error, info};

use crate::{
  model::{Inference, InferenceError, RawOutput},
  preprocess::InputTensor,
};

const RGB_CHANNELS: usize = 3;

fn backend(e: impl std::fmt::Display) -> InferenceError {
  InferenceError::Backend(e.to_string())
}

/// 基于 `ort` 会话的推理后端
///
/// 对外声明通道在最后的输入形状；模型本身为 `[1, 3, H, W]` 时在推理前转置。
pub struct OnnxInference {
  session: Session,
  input_name: String,
  shape: Vec<usize>,
  channel_first: bool,
}

impl OnnxInference {
  pub fn load<P: AsRef<Path>>(path: P, num_threads: Option<usize>) -> Result<Self, InferenceError> {
    let path = path.as_ref();
    if !path.exists() {
      error!("模型文件不存在: {}", path.display());
      return Err(InferenceError::ModelPath(format!(
        "模型文件不存在: {}",
        path.display()
      )));
    }

    info!("加载模型文件: {}", path.display());
    let mut builder = Session::builder()
      .map_err(backend)?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(backend)?;
    if let Some(threads) = num_threads {
      debug!("推理线程数: {}", threads);
      builder = builder.with_intra_threads(threads).map_err(backend)?;
    }
    let session = builder.commit_from_file(path).map_err(backend)?;
    info!("模型加载完成");

    let input = session
      .inputs
      .first()
      .ok_or_else(|| InferenceError::Backend("模型没有输入".to_string()))?;
    let dims: Vec<i64> = match &input.input_type {
      ValueType::Tensor { shape, .. } => shape.iter().copied().collect(),
      other => {
        return Err(InferenceError::Backend(format!(
          "模型输入不是张量: {:?}",
          other
        )));
      }
    };
    let input_name = input.name.clone();
    debug!("模型输入 {}: {:?}", input_name, dims);

    let mut declared = Vec::with_capacity(dims.len());
    for (axis, dim) in dims.iter().enumerate() {
      match *dim {
        d if d > 0 => declared.push(d as usize),
        // 仅允许批次维度为动态
        _ if axis == 0 && dims.len() == 4 => declared.push(1),
        _ => {
          return Err(InferenceError::Backend(format!(
            "不支持动态输入尺寸: {:?}",
            dims
          )));
        }
      }
    }

    let channel_first = declared.len() == 4
      && declared[1] == RGB_CHANNELS
      && declared[3] != RGB_CHANNELS;
    let shape = if channel_first {
      vec![declared[0], declared[2], declared[3], declared[1]]
    } else {
      declared
    };
    info!(
      "输入形状: {:?}{}",
      shape,
      if channel_first { " (模型为 NCHW)" } else { "" }
    );

    Ok(Self {
      input_name,
      session,
      shape,
      channel_first,
    })
  }
}

impl Inference for OnnxInference {
  fn input_shape(&self) -> &[usize] {
    &self.shape
  }

  fn run(&mut self, input: &InputTensor) -> Result<RawOutput, InferenceError> {
    if input.shape() != self.shape.as_slice() {
      return Err(InferenceError::InputShape {
        expected: self.shape.clone(),
        actual: input.shape().to_vec(),
      });
    }

    let array = if self.channel_first {
      input.view().permuted_axes(IxDyn(&[0, 3, 1, 2])).to_owned()
    } else {
      input.view().to_owned()
    };
    let shape = array.shape().to_vec();
    let data: Vec<f32> = array.iter().copied().collect();
    let tensor = Tensor::from_array((shape, data)).map_err(backend)?;

    let outputs = self
      .session
      .run(inputs![self.input_name.as_str() => tensor])
      .map_err(backend)?;

    let mut tensors = Vec::with_capacity(outputs.len());
    for index in 0..outputs.len() {
      let (shape, data) = outputs[index].try_extract_tensor::<f32>().map_err(backend)?;
      let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
      let array = ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec()).map_err(backend)?;
      tensors.push(array);
    }
    debug!(
      "推理输出形状: {:?}",
      tensors.iter().map(|t| t.shape().to_vec()).collect::<Vec<_>>()
    );

    Ok(RawOutput::new(tensors))
  }
}
