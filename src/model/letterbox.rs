// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/model/letterbox.rs - 等比缩放与填充预处理
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

use image::{Rgb, RgbImage, imageops};
use tracing::debug;

use crate::{
  error::InvalidImageError,
  frame::{PreparedTensor, TileImage},
};

/// 画布填充值（中灰）
pub const LETTERBOX_PAD_VALUE: u8 = 114;
const RGB_CHANNELS: usize = 3;

/// 图块坐标与模型输入坐标之间的变换
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub scale: f32,
  pub pad_left: u32,
  pub pad_top: u32,
  pub resized_width: u32,
  pub resized_height: u32,
  pub src_width: u32,
  pub src_height: u32,
  pub target: u32,
}

impl Letterbox {
  /// 小于目标尺寸的图块同样会被放大
  pub fn compute(src_width: u32, src_height: u32, target: u32) -> Result<Self, InvalidImageError> {
    if src_width == 0 || src_height == 0 {
      return Err(InvalidImageError::EmptyImage {
        width: src_width,
        height: src_height,
      });
    }
    if target == 0 {
      return Err(InvalidImageError::InvalidTarget(target));
    }

    let s = target as f64;
    let scale = (s / src_width as f64).min(s / src_height as f64);
    let resized_width = ((src_width as f64 * scale).round() as u32).clamp(1, target);
    let resized_height = ((src_height as f64 * scale).round() as u32).clamp(1, target);

    Ok(Self {
      scale: scale as f32,
      pad_left: (target - resized_width) / 2,
      pad_top: (target - resized_height) / 2,
      resized_width,
      resized_height,
      src_width,
      src_height,
      target,
    })
  }

  /// 模型输入坐标 -> 图块坐标
  pub fn to_tile(&self, x: f32, y: f32) -> (f32, f32) {
    (
      (x - self.pad_left as f32) / self.scale,
      (y - self.pad_top as f32) / self.scale,
    )
  }

  /// 图块坐标 -> 模型输入坐标
  pub fn to_model(&self, x: f32, y: f32) -> (f32, f32) {
    (
      x * self.scale + self.pad_left as f32,
      y * self.scale + self.pad_top as f32,
    )
  }
}

pub struct Preprocessor {
  target: u32,
  pad_value: u8,
  filter: imageops::FilterType,
}

impl Preprocessor {
  pub fn new(target: u32) -> Self {
    Self {
      target,
      pad_value: LETTERBOX_PAD_VALUE,
      // 三角滤波在缩小时按面积加权
      filter: imageops::FilterType::Triangle,
    }
  }

  pub fn pad_value(mut self, value: u8) -> Self {
    self.pad_value = value;
    self
  }

  pub fn prepare(&self, image: &TileImage) -> Result<PreparedTensor, InvalidImageError> {
    let letterbox = Letterbox::compute(image.width(), image.height(), self.target)?;
    debug!(
      "预处理: {}x{} -> {}x{} (缩放 {:.4}, 填充 左 {} 上 {})",
      image.width(),
      image.height(),
      letterbox.resized_width,
      letterbox.resized_height,
      letterbox.scale,
      letterbox.pad_left,
      letterbox.pad_top
    );

    let rgb = image.to_rgb_image();
    let resized = if rgb.dimensions() == (letterbox.resized_width, letterbox.resized_height) {
      rgb
    } else {
      imageops::resize(
        &rgb,
        letterbox.resized_width,
        letterbox.resized_height,
        self.filter,
      )
    };

    let mut canvas = RgbImage::from_pixel(self.target, self.target, Rgb([self.pad_value; 3]));
    imageops::replace(
      &mut canvas,
      &resized,
      letterbox.pad_left as i64,
      letterbox.pad_top as i64,
    );

    let side = self.target as usize;
    let plane = side * side;
    let mut data = vec![0f32; RGB_CHANNELS * plane];
    for (x, y, pixel) in canvas.enumerate_pixels() {
      let idx = y as usize * side + x as usize;
      for c in 0..RGB_CHANNELS {
        data[c * plane + idx] = pixel[c] as f32 / 255.0;
      }
    }

    Ok(PreparedTensor::new(
      data,
      [1, RGB_CHANNELS, side, side],
      letterbox,
    ))
  }
}
