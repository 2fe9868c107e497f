// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/lib.rs - 库主文件
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

pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod input;
pub mod model;
pub mod output;
pub mod task;

use std::path::PathBuf;

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}

/// 将 URL 的路径部分还原为本地路径（处理百分号编码与 Windows 盘符）
pub fn url_to_path(url: &url::Url) -> PathBuf {
  let raw = url.path();
  let decoded = urlencoding::decode(raw)
    .map(|s| s.into_owned())
    .unwrap_or_else(|_| raw.to_string());

  // 形如 "/C:/data/tile.tif" 的路径去掉开头的斜杠
  let bytes = decoded.as_bytes();
  if bytes.len() >= 3 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':' {
    return PathBuf::from(&decoded[1..]);
  }

  PathBuf::from(decoded)
}
