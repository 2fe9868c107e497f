// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/output.rs - 检测结果输出
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

use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::TileFrame, model::DetectResult};

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

mod record;
pub use self::record::{JsonRecordOutput, RecordOutputError, TileRecord, class_counts};

#[cfg(feature = "save_annotated")]
pub mod draw;
#[cfg(feature = "save_annotated")]
pub use self::draw::{AnnotatedImageError, AnnotatedImageOutput};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("记录输出错误: {0}")]
  Record(#[from] RecordOutputError),
  #[cfg(feature = "save_annotated")]
  #[error("标注图像输出错误: {0}")]
  AnnotatedImage(#[from] AnnotatedImageError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum OutputWrapper {
  JsonRecord(JsonRecordOutput),
  #[cfg(feature = "save_annotated")]
  AnnotatedImage(AnnotatedImageOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      JsonRecordOutput::SCHEME => Ok(OutputWrapper::JsonRecord(JsonRecordOutput::from_url(url)?)),
      #[cfg(feature = "save_annotated")]
      AnnotatedImageOutput::SCHEME => Ok(OutputWrapper::AnnotatedImage(
        AnnotatedImageOutput::from_url(url)?,
      )),
      other => Err(OutputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl Render<TileFrame, DetectResult> for OutputWrapper {
  type Error = OutputError;

  fn render_result(&self, frame: &TileFrame, result: &DetectResult) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::JsonRecord(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      #[cfg(feature = "save_annotated")]
      OutputWrapper::AnnotatedImage(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
    }
  }
}

/// 依次交给每个输出
impl<F, D, R: Render<F, D>> Render<F, D> for Vec<R> {
  type Error = R::Error;

  fn render_result(&self, frame: &F, result: &D) -> Result<(), Self::Error> {
    for output in self {
      output.render_result(frame, result)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("rtsp://localhost/stream").unwrap();
    assert!(matches!(
      OutputWrapper::from_url(&url),
      Err(OutputError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn jsonl_scheme_builds_record_output() {
    let dir = tempfile::tempdir().unwrap();
    let url = Url::parse(&format!("jsonl://{}/out.jsonl", dir.path().display())).unwrap();
    assert!(matches!(
      OutputWrapper::from_url(&url),
      Ok(OutputWrapper::JsonRecord(_))
    ));
  }
}
