// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/output/json_output.rs - JSON 结果输出
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
  io::Write,
  path::{Path, PathBuf},
};

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{DetectResult, Detection},
  output::{FrameTag, Render},
};

#[derive(Error, Debug)]
pub enum JsonOutputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  SerializeError(#[from] serde_json::Error),
}

/// 将检测结果写为 JSON
///
/// 默认每帧覆盖写入一个格式化文档；带 `lines` 参数时每帧追加一行。
pub struct JsonOutput {
  path: PathBuf,
  lines: bool,
}

impl FromUrlWithScheme for JsonOutput {
  const SCHEME: &'static str = "json";
}

impl FromUrl for JsonOutput {
  type Error = JsonOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(JsonOutputError::SchemeMismatch(format!(
        "期望输出方式 '{}', 实际输出方式 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    Ok(JsonOutput {
      path: PathBuf::from(url.path()),
      lines: url.query_pairs().any(|(k, _)| k == "lines"),
    })
  }
}

fn detection_value(detection: &Detection) -> Value {
  let mut value = json!({
    "label": detection.label,
    "score": detection.score,
    "bbox": detection.bbox,
  });
  if let Some(mask) = &detection.mask {
    value["mask"] = json!({
      "x": mask.x,
      "y": mask.y,
      "width": mask.width,
      "height": mask.height,
      "grid": [mask.grid_width, mask.grid_height],
      "area": mask.area(),
    });
  }
  value
}

fn result_value(frame: &FrameTag, result: &DetectResult) -> Value {
  json!({
    "frame": frame.index,
    "source": frame.source,
    "detections": result.iter().map(detection_value).collect::<Vec<_>>(),
  })
}

impl JsonOutput {
  fn ensure_parent(path: &Path) -> Result<(), JsonOutputError> {
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    Ok(())
  }
}

impl Render<FrameTag, DetectResult> for JsonOutput {
  type Error = JsonOutputError;

  fn render_result(&self, frame: &FrameTag, result: &DetectResult) -> Result<(), Self::Error> {
    Self::ensure_parent(&self.path)?;
    let value = result_value(frame, result);

    if self.lines {
      let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&self.path)?;
      writeln!(file, "{}", serde_json::to_string(&value)?)?;
      debug!("追加第 {} 帧结果到 {}", frame.index, self.path.display());
    } else {
      std::fs::write(&self.path, serde_json::to_string_pretty(&value)?)?;
      info!("保存检测结果到文件: {}", self.path.display());
    }
    Ok(())
  }
}
