// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/input/read_image_file.rs - 从图像文件读取图块
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

use image::ImageReader;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::InvalidImageError,
  frame::{TileFrame, TileImage},
  url_to_path,
};

const TILE_EXTENSIONS: [&str; 5] = ["tif", "tiff", "png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("目录中没有图块: {0}")]
  NoTiles(PathBuf),
}

fn is_tile(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .is_some_and(|ext| TILE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// 读取图块并统一为 8 位 RGB
pub fn read_tile(path: &Path) -> Result<TileImage, InvalidImageError> {
  let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
  debug!(
    "读取图块 {}: {}x{} {:?}",
    path.display(),
    image.width(),
    image.height(),
    image.color()
  );
  Ok(TileImage::from(image))
}

/// 单个图像文件或目录中的全部图块
#[derive(Debug, Clone)]
pub struct ImageFileInput {
  paths: Vec<PathBuf>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME && url.scheme() != "file" {
      error!(
        "URI 方案不匹配: 期望 '{}' 或 'file', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch(url.scheme().to_string()));
    }

    let path = url_to_path(url);
    if path.is_dir() {
      Self::from_dir(&path)
    } else {
      Ok(Self::from_paths(vec![path]))
    }
  }
}

impl ImageFileInput {
  pub fn from_paths(paths: Vec<PathBuf>) -> Self {
    Self { paths }
  }

  /// 按文件名排序，忽略非图像文件
  pub fn from_dir(dir: &Path) -> Result<Self, ImageFileInputError> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
      let path = entry?.path();
      if path.is_file() && is_tile(&path) {
        paths.push(path);
      }
    }
    if paths.is_empty() {
      return Err(ImageFileInputError::NoTiles(dir.to_path_buf()));
    }
    paths.sort();
    Ok(Self { paths })
  }

  pub fn paths(&self) -> &[PathBuf] {
    &self.paths
  }

  pub fn len(&self) -> usize {
    self.paths.len()
  }

  pub fn is_empty(&self) -> bool {
    self.paths.is_empty()
  }
}

impl IntoIterator for ImageFileInput {
  type Item = Result<TileFrame, (PathBuf, InvalidImageError)>;
  type IntoIter = ImageFileIter;

  fn into_iter(self) -> Self::IntoIter {
    ImageFileIter {
      paths: self.paths.into_iter().enumerate(),
    }
  }
}

/// 逐个加载图块，同一时刻只持有一张图像
pub struct ImageFileIter {
  paths: std::iter::Enumerate<std::vec::IntoIter<PathBuf>>,
}

impl Iterator for ImageFileIter {
  type Item = Result<TileFrame, (PathBuf, InvalidImageError)>;

  fn next(&mut self) -> Option<Self::Item> {
    let (index, path) = self.paths.next()?;
    Some(match read_tile(&path) {
      Ok(image) => Ok(TileFrame { index, path, image }),
      Err(e) => Err((path, e)),
    })
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    self.paths.size_hint()
  }
}

impl ExactSizeIterator for ImageFileIter {}
