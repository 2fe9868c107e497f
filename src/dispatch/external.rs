// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/dispatch/external.rs - 旧格式模型的外部执行
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

use std::{
  io::{BufRead, BufReader, BufWriter},
  path::Path,
  process::Stdio,
  thread,
};

use image::ImageFormat;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
  dispatch::sidecar::SidecarWorker,
  error::ExternalExecutionError,
  frame::TileImage,
  model::{DetectItem, DetectParams, DetectResult},
};

/// 旧格式模型的执行桥，内部实现不透明
pub trait ExternalExecutor: Send + Sync {
  fn execute(
    &self,
    legacy: &Path,
    image: &TileImage,
    params: &DetectParams,
  ) -> Result<DetectResult, ExternalExecutionError>;
}

/// 未配置外部执行器时使用
#[derive(Debug, Clone)]
pub struct UnavailableExecutor(pub String);

impl ExternalExecutor for UnavailableExecutor {
  fn execute(
    &self,
    _legacy: &Path,
    _image: &TileImage,
    _params: &DetectParams,
  ) -> Result<DetectResult, ExternalExecutionError> {
    Err(ExternalExecutionError::Unavailable(self.0.clone()))
  }
}

#[derive(Debug, Deserialize)]
struct WorkerDetection {
  x1: f32,
  y1: f32,
  x2: f32,
  y2: f32,
  class_id: u32,
  conf: f32,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerMessage {
  #[serde(default)]
  done: bool,
  #[serde(default)]
  detections: Option<Vec<WorkerDetection>>,
  #[serde(default)]
  error: Option<String>,
}

/// 通过外部工作进程的 `--detect <模型> <图块> <配置 JSON>` 子命令执行检测，
/// 工作进程需实现该子命令，并以 `{"done": true, "detections": [...]}` 行结束输出
#[derive(Debug, Clone)]
pub struct SidecarExecutor {
  worker: SidecarWorker,
}

impl SidecarExecutor {
  pub fn new(worker: SidecarWorker) -> Self {
    Self { worker }
  }
}

fn write_tile_png(image: &TileImage) -> Result<tempfile::NamedTempFile, ExternalExecutionError> {
  let file = tempfile::Builder::new()
    .prefix("zonglv-tile-")
    .suffix(".png")
    .tempfile()?;
  let mut writer = BufWriter::new(file.as_file());
  image
    .to_rgb_image()
    .write_to(&mut writer, ImageFormat::Png)
    .map_err(|e| ExternalExecutionError::Io(std::io::Error::other(e.to_string())))?;
  drop(writer);
  Ok(file)
}

/// 解析工作进程的标准输出，返回结束行
fn parse_worker_output(
  lines: impl Iterator<Item = std::io::Result<String>>,
) -> Result<Option<WorkerMessage>, ExternalExecutionError> {
  let mut last_error = None;
  for line in lines {
    let line = line?;
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }
    match serde_json::from_str::<WorkerMessage>(trimmed) {
      Ok(message) if message.done => return Ok(Some(message)),
      Ok(message) => {
        if let Some(error) = message.error {
          last_error = Some(error);
        }
      }
      Err(_) => debug!("[worker] {}", trimmed),
    }
  }

  match last_error {
    Some(error) => Ok(Some(WorkerMessage {
      done: false,
      detections: None,
      error: Some(error),
    })),
    None => Ok(None),
  }
}

fn into_result(detections: Vec<WorkerDetection>, max_det: usize) -> DetectResult {
  let mut items: Vec<DetectItem> = detections
    .into_iter()
    .map(|d| DetectItem {
      class_id: d.class_id,
      score: d.conf,
      bbox: [d.x1, d.y1, d.x2, d.y2],
    })
    .collect();
  items.sort_by(|a, b| b.score.total_cmp(&a.score));
  items.truncate(max_det);
  DetectResult {
    items: items.into_boxed_slice(),
  }
}

impl ExternalExecutor for SidecarExecutor {
  fn execute(
    &self,
    legacy: &Path,
    image: &TileImage,
    params: &DetectParams,
  ) -> Result<DetectResult, ExternalExecutionError> {
    let tile = write_tile_png(image)?;
    let config = serde_json::json!({
      "imgsz": params.input_size,
      "conf": params.confidence,
      "iou": params.iou,
      "max_det": params.max_det,
      "device": params.device.to_string(),
    });

    info!("调用外部执行器: {}", self.worker.path().display());
    let mut child = self
      .worker
      .command()
      .arg("--detect")
      .arg(legacy)
      .arg(tile.path())
      .arg(config.to_string())
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .map_err(ExternalExecutionError::Spawn)?;

    let stderr = child.stderr.take().ok_or_else(|| {
      ExternalExecutionError::Unavailable("无法获取外部执行器的标准错误".to_string())
    })?;
    let stderr_handle = thread::spawn(move || {
      let mut tail = Vec::new();
      for line in BufReader::new(stderr).lines().map_while(Result::ok) {
        if line.trim().is_empty() {
          continue;
        }
        info!("[worker] {}", line);
        tail.push(line);
        if tail.len() > 5 {
          tail.remove(0);
        }
      }
      tail
    });

    let stdout = child.stdout.take().ok_or_else(|| {
      ExternalExecutionError::Unavailable("无法获取外部执行器的标准输出".to_string())
    })?;
    let parsed = parse_worker_output(BufReader::new(stdout).lines());

    let status = child.wait()?;
    let stderr_tail = stderr_handle.join().unwrap_or_default().join("\n");
    let message = parsed?;

    if !status.success() {
      let message = message
        .and_then(|m| m.error)
        .unwrap_or(stderr_tail);
      warn!("外部执行器异常退出: {:?}", status.code());
      return Err(ExternalExecutionError::NonZeroExit {
        code: status.code(),
        message,
      });
    }

    match message {
      Some(WorkerMessage {
        done: true,
        detections,
        ..
      }) => Ok(into_result(detections.unwrap_or_default(), params.max_det)),
      Some(WorkerMessage {
        error: Some(error), ..
      }) => Err(ExternalExecutionError::MalformedOutput(error)),
      _ => Err(ExternalExecutionError::MalformedOutput(
        "外部执行器未输出结束行".to_string(),
      )),
    }
  }
}
