// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/output/record.rs - 检测结果记录 (JSON Lines)
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
  collections::BTreeMap,
  fs::{File, OpenOptions},
  io::{BufWriter, Write},
  path::{Path, PathBuf},
  sync::Mutex,
};

use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::TileFrame,
  model::{DetectItem, DetectResult},
  output::Render,
  url_to_path,
};

#[derive(Error, Debug)]
pub enum RecordOutputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  Serialize(#[from] serde_json::Error),
}

/// 每个图块一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileRecord {
  pub timestamp: String,
  pub tile: PathBuf,
  pub width: u32,
  pub height: u32,
  pub detections: Vec<DetectItem>,
  pub counts: BTreeMap<u32, usize>,
}

impl TileRecord {
  pub fn new(frame: &TileFrame, result: &DetectResult) -> Self {
    Self {
      timestamp: Local::now().to_rfc3339(),
      tile: frame.path.clone(),
      width: frame.image.width(),
      height: frame.image.height(),
      detections: result.items.to_vec(),
      counts: class_counts(&result.items),
    }
  }
}

pub fn class_counts(items: &[DetectItem]) -> BTreeMap<u32, usize> {
  let mut counts = BTreeMap::new();
  for item in items {
    *counts.entry(item.class_id).or_insert(0) += 1;
  }
  counts
}

pub struct JsonRecordOutput {
  path: PathBuf,
  writer: Mutex<BufWriter<File>>,
}

impl FromUrlWithScheme for JsonRecordOutput {
  const SCHEME: &'static str = "jsonl";
}

impl FromUrl for JsonRecordOutput {
  type Error = RecordOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RecordOutputError::SchemeMismatch(url.scheme().to_string()));
    }
    Self::create(&url_to_path(url))
  }
}

impl JsonRecordOutput {
  /// 以追加方式打开，不截断已有记录
  pub fn create(path: &Path) -> Result<Self, RecordOutputError> {
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Self {
      path: path.to_path_buf(),
      writer: Mutex::new(BufWriter::new(file)),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Render<TileFrame, DetectResult> for JsonRecordOutput {
  type Error = RecordOutputError;

  fn render_result(&self, frame: &TileFrame, result: &DetectResult) -> Result<(), Self::Error> {
    let record = TileRecord::new(frame, result);
    let line = serde_json::to_string(&record)?;

    let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
    writeln!(writer, "{}", line)?;
    writer.flush()?;
    debug!("写入记录: {}", frame.path.display());
    Ok(())
  }
}
