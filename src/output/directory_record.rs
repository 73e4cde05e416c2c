// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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
  path::{Path, PathBuf},
  sync::{Mutex, PoisonError},
};

use chrono::{Datelike, Utc};
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::DetectResult,
  output::{FrameTag, Render},
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 每帧一行一个检测：`标签, 分数, x1, y1, x2, y2`
fn record(result: &DetectResult, path: &Path) -> Result<(), std::io::Error> {
  let mut records = Vec::with_capacity(result.len());
  for item in result.iter() {
    records.push(format!(
      "{}, {:.4}, {:.4}, {:.4}, {:.4}, {:.4}",
      item.label, item.score, item.bbox[0], item.bbox[1], item.bbox[2], item.bbox[3]
    ));
  }
  std::fs::write(path, records.join("\n"))
}

/// 按日期分目录保存每帧的检测记录
///
/// 路径形如 `<目录>/YYYY/MM/DD/HH-MM-SS-XXXX.txt`，`XXXX` 为十六进制帧计数。
/// 默认只记录有检测结果的帧，带 `always` 参数时记录所有帧。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  frame_counter: Mutex<u16>,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(uri.path()),
      frame_counter: Mutex::new(0),
      always: uri.query_pairs().any(|(k, _)| k == "always"),
    })
  }
}

impl DirectoryRecordOutput {
  fn frame_id(&self) -> u16 {
    let mut counter = self
      .frame_counter
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    *counter = counter.wrapping_add(1);
    *counter
  }

  fn frame_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    Ok(directory.join(format!(
      "{}-{:04X}.txt",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl Render<FrameTag, DetectResult> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &FrameTag, result: &DetectResult) -> Result<(), Self::Error> {
    if !self.always && result.is_empty() {
      return Ok(());
    }
    let path = self.frame_path()?;
    record(result, &path)?;
    debug!("第 {} 帧记录保存到 {}", frame.index, path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::Detection;

  fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
      return files;
    };
    for entry in entries.flatten() {
      let path = entry.path();
      if path.is_dir() {
        files.extend(files_under(&path));
      } else {
        files.push(path);
      }
    }
    files
  }

  #[test]
  fn records_only_non_empty_frames_by_default() {
    let dir = std::env::temp_dir().join(format!("qingfeng-record-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let url = url::Url::parse(&format!("folder://{}", dir.display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();

    output
      .render_result(&FrameTag::new(0, "test"), &DetectResult::default())
      .unwrap();
    assert!(files_under(&dir).is_empty());

    let result = DetectResult::from(vec![Detection {
      label: "person".to_string(),
      score: 0.9,
      bbox: [1.0, 2.0, 3.0, 4.0],
      mask: None,
    }]);
    output.render_result(&FrameTag::new(1, "test"), &result).unwrap();

    let files = files_under(&dir);
    assert_eq!(files.len(), 1);
    assert!(files[0].to_string_lossy().ends_with("-0001.txt"));
    let content = std::fs::read_to_string(&files[0]).unwrap();
    assert_eq!(content, "person, 0.9000, 1.0000, 2.0000, 3.0000, 4.0000");
    let _ = std::fs::remove_dir_all(&dir);
  }
}
