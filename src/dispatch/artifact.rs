// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/dispatch/artifact.rs - 模型制品与模型库接口
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

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{FromUrl, error::ModelLoadError, url_to_path};

const NATIVE_EXTENSION: &str = "onnx";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactFormat {
  NativeTensor,
  Legacy,
}

impl ArtifactFormat {
  /// 根据扩展名推断格式
  pub fn from_path(path: &Path) -> Option<Self> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
      NATIVE_EXTENSION => Some(ArtifactFormat::NativeTensor),
      "pt" | "pth" => Some(ArtifactFormat::Legacy),
      _ => None,
    }
  }
}

/// 模型库中的一条模型记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelArtifact {
  pub name: String,
  pub path: PathBuf,
  pub format: ArtifactFormat,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sibling: Option<PathBuf>,
}

impl ModelArtifact {
  pub fn new(path: impl Into<PathBuf>, format: ArtifactFormat) -> Self {
    let path = path.into();
    let name = path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_default();
    Self {
      name,
      path,
      format,
      sibling: None,
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_sibling(mut self, sibling: impl Into<PathBuf>) -> Self {
    self.sibling = Some(sibling.into());
    self
  }

  /// 转换产物的约定位置：同目录同名 .onnx
  pub fn sibling_target(&self) -> PathBuf {
    self.path.with_extension(NATIVE_EXTENSION)
  }

  /// 已落盘的转换产物
  pub fn materialized_sibling(&self) -> Option<PathBuf> {
    if self.format != ArtifactFormat::Legacy {
      return None;
    }
    if let Some(sibling) = &self.sibling
      && sibling.is_file()
    {
      return Some(sibling.clone());
    }
    let target = self.sibling_target();
    target.is_file().then_some(target)
  }
}

impl FromUrl for ModelArtifact {
  type Error = ModelLoadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let path = url_to_path(url);
    let format = match url.scheme() {
      "onnx" => ArtifactFormat::NativeTensor,
      "pt" => ArtifactFormat::Legacy,
      "file" => ArtifactFormat::from_path(&path).ok_or_else(|| {
        ModelLoadError::PathError(format!("无法从扩展名判断模型格式: {}", path.display()))
      })?,
      other => {
        return Err(ModelLoadError::PathError(format!(
          "不支持的模型方案: {}",
          other
        )));
      }
    };
    Ok(ModelArtifact::new(path, format))
  }
}

#[derive(Error, Debug)]
pub enum RegistryError {
  #[error("模型记录不存在: {0}")]
  NotFound(String),
  #[error("模型记录写入失败: {0}")]
  Write(String),
}

/// 模型库，只需要支持回写转换产物路径
pub trait ModelRegistry: Send + Sync {
  fn record_sibling(&self, artifact: &ModelArtifact, sibling: &Path) -> Result<(), RegistryError>;
}

/// 不持久化任何内容的模型库
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistry;

impl ModelRegistry for NoopRegistry {
  fn record_sibling(&self, _artifact: &ModelArtifact, _sibling: &Path) -> Result<(), RegistryError> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn format_follows_scheme_or_extension() {
    let onnx = ModelArtifact::from_url(&Url::parse("onnx:///m/palm.onnx").unwrap()).unwrap();
    assert_eq!(onnx.format, ArtifactFormat::NativeTensor);
    assert_eq!(onnx.name, "palm");

    let pt = ModelArtifact::from_url(&Url::parse("file:///m/palm.PT").unwrap()).unwrap();
    assert_eq!(pt.format, ArtifactFormat::Legacy);

    assert!(ModelArtifact::from_url(&Url::parse("file:///m/palm.bin").unwrap()).is_err());
    assert!(ModelArtifact::from_url(&Url::parse("tflite:///m/palm.tflite").unwrap()).is_err());
  }

  #[test]
  fn sibling_on_disk_is_discovered() {
    let dir = tempfile::tempdir().unwrap();
    let legacy = dir.path().join("palm.pt");
    std::fs::write(&legacy, b"weights").unwrap();
    let artifact = ModelArtifact::new(&legacy, ArtifactFormat::Legacy);

    assert_eq!(artifact.sibling_target(), dir.path().join("palm.onnx"));
    assert_eq!(artifact.materialized_sibling(), None);

    std::fs::write(dir.path().join("palm.onnx"), b"graph").unwrap();
    assert_eq!(
      artifact.materialized_sibling(),
      Some(dir.path().join("palm.onnx"))
    );
  }

  #[test]
  fn native_artifact_never_has_sibling() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("palm.onnx");
    std::fs::write(&path, b"graph").unwrap();
    let artifact = ModelArtifact::new(&path, ArtifactFormat::NativeTensor);
    assert_eq!(artifact.materialized_sibling(), None);
  }

  #[test]
  fn format_serializes_kebab_case() {
    let json = serde_json::to_string(&ArtifactFormat::NativeTensor).unwrap();
    assert_eq!(json, "\"native-tensor\"");
  }
}
