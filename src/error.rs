// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/error.rs - 错误类型定义
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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelLoadError {
  #[error("模型文件不存在: {0}")]
  NotFound(PathBuf),
  #[error("模型文件无法读取: {path}, 错误: {source}")]
  Unreadable {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("模型无效: {path}, 原因: {reason}")]
  InvalidGraph { path: PathBuf, reason: String },
  #[error("模型路径错误: {0}")]
  PathError(String),
}

#[derive(Error, Debug)]
pub enum InvalidImageError {
  #[error("图像尺寸无效: {width}x{height}")]
  EmptyImage { width: u32, height: u32 },
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  BufferSize { expected: usize, actual: usize },
  #[error("不支持的通道数: {0}")]
  UnsupportedChannels(u8),
  #[error("目标输入尺寸无效: {0}")]
  InvalidTarget(u32),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("图像解码错误: {0}")]
  Decode(#[from] image::ImageError),
}

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("输入形状不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  ShapeMismatch { expected: Vec<i64>, actual: Vec<usize> },
  #[error("推理内存不足: {0}")]
  OutOfMemory(String),
  #[error("推理后端错误: {0}")]
  Backend(String),
  #[error("模型输出格式错误: {0}")]
  MalformedOutput(String),
}

#[derive(Error, Debug)]
pub enum ConversionError {
  #[error("模型转换不可用: {0}")]
  Unavailable(String),
  #[error("无法启动转换进程: {0}")]
  Spawn(#[source] std::io::Error),
  #[error("模型转换失败 (退出码 {code:?}): {message}")]
  Failed { code: Option<i32>, message: String },
  #[error("转换完成但未找到输出文件: {0}")]
  MissingOutput(PathBuf),
  #[error("此前的转换已失败: {0}")]
  PreviouslyFailed(String),
}

#[derive(Error, Debug)]
pub enum ExternalExecutionError {
  #[error("外部执行器不可用: {0}")]
  Unavailable(String),
  #[error("无法启动外部执行器: {0}")]
  Spawn(#[source] std::io::Error),
  #[error("外部执行器异常退出 (退出码 {code:?}): {message}")]
  NonZeroExit { code: Option<i32>, message: String },
  #[error("外部执行器输出格式错误: {0}")]
  MalformedOutput(String),
  #[error("外部执行器 I/O 错误: {0}")]
  Io(#[from] std::io::Error),
}

/// 错误归类，调用方据此决定是否重试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
  /// 调用方输入有误，不应重试
  BadInput,
  /// 后端或运行环境问题，可更换设备后重试
  Backend,
  /// 外部进程失败，内部细节不透明
  External,
}

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("参数无效: {0}")]
  InvalidParams(String),
  #[error(transparent)]
  ModelLoad(#[from] ModelLoadError),
  #[error(transparent)]
  InvalidImage(#[from] InvalidImageError),
  #[error(transparent)]
  Inference(#[from] InferenceError),
  #[error(transparent)]
  Conversion(#[from] ConversionError),
  #[error(transparent)]
  ExternalExecution(#[from] ExternalExecutionError),
}

impl DetectError {
  pub fn class(&self) -> ErrorClass {
    match self {
      DetectError::InvalidParams(_) | DetectError::InvalidImage(_) => ErrorClass::BadInput,
      // 模型不存在或路径写错时，换设备重试无济于事
      DetectError::ModelLoad(ModelLoadError::NotFound(_) | ModelLoadError::PathError(_)) => {
        ErrorClass::BadInput
      }
      DetectError::ModelLoad(_) | DetectError::Inference(_) | DetectError::Conversion(_) => {
        ErrorClass::Backend
      }
      DetectError::ExternalExecution(_) => ErrorClass::External,
    }
  }
}
