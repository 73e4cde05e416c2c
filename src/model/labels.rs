// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/model/labels.rs - 类别标签表
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
  io::{BufRead, BufReader, Read},
  path::Path,
};

use thiserror::Error;
use tracing::{info, warn};

pub const UNKNOWN_LABEL: &str = "unknown";

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("标签文件读取错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("标签文件为空")]
  Empty,
}

/// 类别序号到名称的映射，每行一个名称
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels {
  names: Vec<String>,
}

impl Labels {
  pub fn from_reader<R: Read>(reader: R) -> Result<Self, LabelError> {
    let mut names = Vec::new();
    for line in BufReader::new(reader).lines() {
      let line = line?;
      let name = line.trim();
      if !name.is_empty() {
        names.push(name.to_string());
      }
    }
    if names.is_empty() {
      return Err(LabelError::Empty);
    }
    Ok(Self { names })
  }

  pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, LabelError> {
    let labels = Self::from_reader(std::fs::File::open(path.as_ref())?)?;
    info!(
      "已加载 {} 个标签: {}",
      labels.len(),
      path.as_ref().display()
    );
    Ok(labels)
  }

  pub fn get(&self, index: usize) -> Option<&str> {
    self.names.get(index).map(String::as_str)
  }

  /// 越界序号记录警告并返回 [`UNKNOWN_LABEL`]
  pub fn resolve(&self, index: usize) -> &str {
    match self.get(index) {
      Some(name) => name,
      None => {
        warn!("类别序号 {} 超出标签表范围 {}", index, self.len());
        UNKNOWN_LABEL
      }
    }
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}

impl<S: Into<String>> FromIterator<S> for Labels {
  fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
    Self {
      names: iter.into_iter().map(Into::into).collect(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn skips_blank_lines_and_trims() {
    let labels = Labels::from_reader("person\n\n  bicycle \r\ncar\n".as_bytes()).unwrap();
    assert_eq!(labels.len(), 3);
    assert_eq!(labels.get(1), Some("bicycle"));
    assert_eq!(labels.resolve(2), "car");
    assert_eq!(labels.resolve(3), UNKNOWN_LABEL);
  }

  #[test]
  fn empty_file_is_rejected() {
    assert!(matches!(
      Labels::from_reader("\n \n".as_bytes()),
      Err(LabelError::Empty)
    ));
  }
}
