// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/output/draw.rs - 绘制检测框并保存标注图像
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

use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::FALLBACK_LINE_WIDTH,
  frame::TileFrame,
  model::{DetectItem, DetectResult},
  output::Render,
  url_to_path,
};

#[derive(Error, Debug)]
pub enum AnnotatedImageError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("参数错误: {0}")]
  InvalidQuery(String),
  #[error("图像错误: {0}")]
  Image(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
}

/// 按类别取色：0 红, 1 绿, 2 蓝, 3 青, 4 品红, 5 黄, 其余灰
pub fn class_color(class_id: u32) -> Rgb<u8> {
  match class_id {
    0 => Rgb([255, 0, 0]),
    1 => Rgb([0, 255, 0]),
    2 => Rgb([0, 0, 255]),
    3 => Rgb([0, 255, 255]),
    4 => Rgb([255, 0, 255]),
    5 => Rgb([255, 255, 0]),
    _ => Rgb([128, 128, 128]),
  }
}

/// 在图像上绘制检测框，线宽通过向内嵌套矩形实现
pub fn draw_detections(image: &mut RgbImage, items: &[DetectItem], line_width: u32) {
  let (w, h) = (image.width() as i32, image.height() as i32);

  for item in items {
    let [x1, y1, x2, y2] = item.bbox.map(|v| v.round() as i32);
    let x_min = x1.min(x2).clamp(0, w);
    let y_min = y1.min(y2).clamp(0, h);
    let x_max = x1.max(x2).clamp(0, w);
    let y_max = y1.max(y2).clamp(0, h);
    let rw = (x_max - x_min).max(1) as u32;
    let rh = (y_max - y_min).max(1) as u32;
    let color = class_color(item.class_id);

    draw_hollow_rect_mut(image, Rect::at(x_min, y_min).of_size(rw, rh), color);
    let layers = (line_width as i32).min(rw as i32 / 2).min(rh as i32 / 2);
    for t in 1..layers {
      let inner_w = rw.saturating_sub(2 * t as u32).max(1);
      let inner_h = rh.saturating_sub(2 * t as u32).max(1);
      let inner = Rect::at(x_min + t, y_min + t).of_size(inner_w, inner_h);
      draw_hollow_rect_mut(image, inner, color);
    }
  }
}

/// 返回不覆盖已有文件的输出路径
pub fn unique_annotated_path(directory: &Path, tile: &Path) -> PathBuf {
  let stem = tile
    .file_stem()
    .and_then(|s| s.to_str())
    .unwrap_or("image");
  let mut out = directory.join(format!("{}_annotated.jpg", stem));
  let mut n = 0u32;
  while out.exists() {
    n += 1;
    out = directory.join(format!("{}_annotated_{}.jpg", stem, n));
  }
  out
}

pub struct AnnotatedImageOutput {
  directory: PathBuf,
  line_width: u32,
  /// 为 false 时跳过没有检测结果的图块
  always: bool,
}

impl FromUrlWithScheme for AnnotatedImageOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for AnnotatedImageOutput {
  type Error = AnnotatedImageError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(AnnotatedImageError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let mut output = AnnotatedImageOutput::new(url_to_path(url));
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "line_width" => {
          output.line_width = v
            .parse()
            .map_err(|_| AnnotatedImageError::InvalidQuery(format!("line_width={}", v)))?;
        }
        "always" => {
          output.always = v
            .parse()
            .map_err(|_| AnnotatedImageError::InvalidQuery(format!("always={}", v)))?;
        }
        _ => {}
      }
    }
    Ok(output)
  }
}

impl AnnotatedImageOutput {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      line_width: FALLBACK_LINE_WIDTH,
      always: true,
    }
  }

  pub fn line_width(mut self, line_width: u32) -> Self {
    self.line_width = line_width;
    self
  }

  pub fn save(&self, frame: &TileFrame, result: &DetectResult) -> Result<PathBuf, AnnotatedImageError> {
    let mut image = frame.image.to_rgb_image();
    draw_detections(&mut image, &result.items, self.line_width);

    std::fs::create_dir_all(&self.directory)?;
    let out = unique_annotated_path(&self.directory, &frame.path);
    image.save(&out)?;
    info!("保存标注图像: {}", out.display());
    Ok(out)
  }
}

impl Render<TileFrame, DetectResult> for AnnotatedImageOutput {
  type Error = AnnotatedImageError;

  fn render_result(&self, frame: &TileFrame, result: &DetectResult) -> Result<(), Self::Error> {
    if self.always || !result.is_empty() {
      self.save(frame, result)?;
    }
    Ok(())
  }
}
