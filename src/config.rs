// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/config.rs - 检测参数配置
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

use std::{fmt::Display, path::Path, path::PathBuf, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  error::DetectError,
  model::{DetectParams, Device},
};

/// 仅在配置完全缺失时使用的回退值
pub const FALLBACK_IMGSZ: u32 = 1280;
pub const FALLBACK_CONF: f32 = 0.2;
pub const FALLBACK_IOU: f32 = 0.2;
pub const FALLBACK_MAX_DET: usize = 10000;
pub const FALLBACK_LINE_WIDTH: u32 = 3;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("配置文件读取失败: {0}")]
  Io(#[from] std::io::Error),
  #[error("配置文件格式错误: {0}")]
  Parse(#[from] serde_json::Error),
}

/// 检测配置，数值字段同时接受数字与字符串
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
  #[serde(deserialize_with = "lenient")]
  pub imgsz: u32,
  #[serde(deserialize_with = "lenient")]
  pub conf: f32,
  #[serde(deserialize_with = "lenient")]
  pub iou: f32,
  #[serde(deserialize_with = "lenient")]
  pub max_det: usize,
  #[serde(deserialize_with = "lenient")]
  pub device: Device,
  #[serde(deserialize_with = "lenient")]
  pub convert_legacy: bool,
  #[serde(deserialize_with = "lenient")]
  pub save_annotated: bool,
  #[serde(deserialize_with = "lenient")]
  pub line_width: u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub worker: Option<PathBuf>,
}

impl Default for DetectConfig {
  fn default() -> Self {
    Self {
      imgsz: FALLBACK_IMGSZ,
      conf: FALLBACK_CONF,
      iou: FALLBACK_IOU,
      max_det: FALLBACK_MAX_DET,
      device: Device::Auto,
      convert_legacy: true,
      save_annotated: false,
      line_width: FALLBACK_LINE_WIDTH,
      worker: None,
    }
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient<T> {
  Value(T),
  Text(String),
}

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
  D: Deserializer<'de>,
  T: Deserialize<'de> + FromStr,
  T::Err: Display,
{
  match Lenient::<T>::deserialize(deserializer)? {
    Lenient::Value(value) => Ok(value),
    Lenient::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
  }
}

impl DetectConfig {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    info!("加载配置文件: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    let config: DetectConfig = serde_json::from_str(&text)?;
    debug!("配置: {:?}", config);
    Ok(config)
  }

  /// 文件不存在时使用回退值
  pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
    match path {
      Some(path) if path.exists() => Self::load(path),
      Some(path) => {
        info!("配置文件 {} 不存在, 使用默认配置", path.display());
        Ok(Self::default())
      }
      None => Ok(Self::default()),
    }
  }

  /// 校验并转换为检测参数，越界值报错而不是截断
  pub fn params(&self) -> Result<DetectParams, DetectError> {
    let params = DetectParams {
      confidence: self.conf,
      iou: self.iou,
      max_det: self.max_det,
      input_size: self.imgsz,
      device: self.device,
    };
    params.validate()?;
    Ok(params)
  }
}
