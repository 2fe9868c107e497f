// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/frame.rs - 图块与输入张量定义
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

use std::path::PathBuf;

use image::{DynamicImage, ImageBuffer, Rgb, RgbImage};

use crate::{error::InvalidImageError, model::letterbox::Letterbox};

/// 像素缓冲区中的通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelOrder {
  #[default]
  Rgb,
  Bgr,
}

/// 内存中的图块，按行优先 HWC 排列的 8 位像素
#[derive(Debug, Clone)]
pub struct TileImage {
  data: Box<[u8]>,
  width: u32,
  height: u32,
  channels: u8,
  order: PixelOrder,
}

impl TileImage {
  /// 支持 1（灰度）、3（彩色）、4（带透明通道）三种通道数
  pub fn new(
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
  ) -> Result<Self, InvalidImageError> {
    if !matches!(channels, 1 | 3 | 4) {
      return Err(InvalidImageError::UnsupportedChannels(channels));
    }

    let expected = width as usize * height as usize * channels as usize;
    if data.len() != expected {
      return Err(InvalidImageError::BufferSize {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
      width,
      height,
      channels,
      order: PixelOrder::Rgb,
    })
  }

  pub fn with_order(mut self, order: PixelOrder) -> Self {
    self.order = order;
    self
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> u8 {
    self.channels
  }

  pub fn order(&self) -> PixelOrder {
    self.order
  }

  pub fn as_raw(&self) -> &[u8] {
    &self.data
  }

  /// 转换为 RGB 图像，灰度复制到三个通道，透明通道直接丢弃
  pub fn to_rgb_image(&self) -> RgbImage {
    let channels = self.channels as usize;
    let width = self.width as usize;
    let data = &self.data;
    let order = self.order;

    ImageBuffer::from_fn(self.width, self.height, |x, y| {
      let idx = (y as usize * width + x as usize) * channels;
      match channels {
        1 => Rgb([data[idx]; 3]),
        _ => match order {
          PixelOrder::Rgb => Rgb([data[idx], data[idx + 1], data[idx + 2]]),
          PixelOrder::Bgr => Rgb([data[idx + 2], data[idx + 1], data[idx]]),
        },
      }
    })
  }
}

impl From<RgbImage> for TileImage {
  fn from(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      data: image.into_raw().into_boxed_slice(),
      width,
      height,
      channels: 3,
      order: PixelOrder::Rgb,
    }
  }
}

impl From<DynamicImage> for TileImage {
  fn from(image: DynamicImage) -> Self {
    match image {
      DynamicImage::ImageRgb8(rgb) => rgb.into(),
      // 调色板、灰度、16 位等统一转为 8 位 RGB
      other => other.to_rgb8().into(),
    }
  }
}

/// 模型输入张量，与逆变换记录绑定在一起，不可拆分
#[derive(Debug, Clone)]
pub struct PreparedTensor {
  data: Vec<f32>,
  shape: [usize; 4],
  letterbox: Letterbox,
}

impl PreparedTensor {
  pub(crate) fn new(data: Vec<f32>, shape: [usize; 4], letterbox: Letterbox) -> Self {
    Self {
      data,
      shape,
      letterbox,
    }
  }

  /// NCHW 排列的浮点数据
  pub fn data(&self) -> &[f32] {
    &self.data
  }

  pub fn shape(&self) -> [usize; 4] {
    self.shape
  }

  pub fn letterbox(&self) -> &Letterbox {
    &self.letterbox
  }
}

/// 批处理中的单个图块
#[derive(Debug, Clone)]
pub struct TileFrame {
  pub index: usize,
  pub path: PathBuf,
  pub image: TileImage,
}
