// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/model.rs - 模型
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

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{error::DetectError, frame::TileImage};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 单个检测结果，坐标为图块像素坐标
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

pub type Detection = DetectItem;

/// 按置信度降序排列
#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

/// 请求的计算设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
  #[default]
  Auto,
  Cpu,
  #[serde(alias = "cuda", alias = "gpu")]
  Accelerated,
}

impl FromStr for Device {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "auto" => Ok(Device::Auto),
      "cpu" => Ok(Device::Cpu),
      "accelerated" | "cuda" | "gpu" => Ok(Device::Accelerated),
      other => Err(format!("未知设备: {}", other)),
    }
  }
}

impl fmt::Display for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Device::Auto => write!(f, "auto"),
      Device::Cpu => write!(f, "cpu"),
      Device::Accelerated => write!(f, "accelerated"),
    }
  }
}

/// 实际生效的计算设备
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveDevice {
  Cpu,
  Cuda,
}

impl fmt::Display for ActiveDevice {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ActiveDevice::Cpu => write!(f, "CPU"),
      ActiveDevice::Cuda => write!(f, "CUDA"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
  pub confidence: f32,
  pub iou: f32,
  pub max_det: usize,
  pub input_size: u32,
  pub device: Device,
}

impl DetectParams {
  pub fn validate(&self) -> Result<(), DetectError> {
    if !(0.0..=1.0).contains(&self.confidence) {
      return Err(DetectError::InvalidParams(format!(
        "置信度阈值必须在 [0, 1] 内, 实际为 {}",
        self.confidence
      )));
    }
    if !(0.0..=1.0).contains(&self.iou) {
      return Err(DetectError::InvalidParams(format!(
        "IoU 阈值必须在 [0, 1] 内, 实际为 {}",
        self.iou
      )));
    }
    if self.max_det == 0 {
      return Err(DetectError::InvalidParams("最大检测数必须大于 0".into()));
    }
    if self.input_size == 0 {
      return Err(DetectError::InvalidParams("输入尺寸必须大于 0".into()));
    }
    Ok(())
  }
}

/// 一次推理请求，构造后不可修改
#[derive(Debug, Clone)]
pub struct InferenceRequest {
  image: TileImage,
  params: DetectParams,
}

impl InferenceRequest {
  pub fn new(image: TileImage, params: DetectParams) -> Result<Self, DetectError> {
    params.validate()?;
    Ok(Self { image, params })
  }

  pub fn image(&self) -> &TileImage {
    &self.image
  }

  pub fn params(&self) -> &DetectParams {
    &self.params
  }

  pub fn into_image(self) -> TileImage {
    self.image
  }
}

pub mod decode;
pub mod engine;
pub mod letterbox;
mod yolo;
pub use self::yolo::{YoloDetector, YoloDetectorBuilder};
