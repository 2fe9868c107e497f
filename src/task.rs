// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/task.rs - 批量检测任务
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
  collections::BTreeMap,
  fmt::Display,
  path::PathBuf,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
  error::InvalidImageError,
  frame::TileFrame,
  model::{DetectParams, DetectResult, InferenceRequest, Model},
  output::Render,
};

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

/// 输入迭代器的元素：加载成功的图块，或加载失败的路径
pub type TileItem = Result<TileFrame, (PathBuf, InvalidImageError)>;

pub struct OneShotTask {
  params: DetectParams,
}

impl OneShotTask {
  pub fn new(params: DetectParams) -> Self {
    Self { params }
  }
}

impl<I, M, O> Task<I, M, O> for OneShotTask
where
  I: IntoIterator<Item = TileItem>,
  M: Model<Input = InferenceRequest, Output = DetectResult>,
  M::Error: std::error::Error + Send + Sync + 'static,
  O: Render<TileFrame, DetectResult>,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  type Output = DetectResult;
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let frame = match input.into_iter().next() {
      Some(Ok(frame)) => frame,
      Some(Err((path, e))) => anyhow::bail!("图块 {} 读取失败: {}", path.display(), e),
      None => anyhow::bail!("没有输入图块"),
    };

    info!("输入图块获取成功，开始推理...");
    let TileFrame { index, path, image } = frame;
    let request = InferenceRequest::new(image, self.params)?;
    let now = Instant::now();
    let result = model.infer(&request)?;
    info!("推理完成，耗时: {:.2?}，检测到 {} 个物体", now.elapsed(), result.len());

    let frame = TileFrame {
      index,
      path,
      image: request.into_image(),
    };
    output.render_result(&frame, &result)?;
    Ok(result)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TileStatus {
  Done,
  Failed,
}

/// 单个图块处理完后的进度
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileProgress {
  pub processed: usize,
  pub total: usize,
  pub current: PathBuf,
  pub status: TileStatus,
  pub detections: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
  pub successful: usize,
  pub failed: usize,
  pub total: usize,
  pub cancelled: bool,
  pub class_counts: BTreeMap<u32, usize>,
}

impl BatchSummary {
  pub fn detections(&self) -> usize {
    self.class_counts.values().sum()
  }
}

/// 逐个图块检测，单个图块失败只计数不中止，图块之间检查取消标志
pub struct BatchTask<'a> {
  params: DetectParams,
  cancel: Arc<AtomicBool>,
  progress: Option<Box<dyn FnMut(&TileProgress) + 'a>>,
}

impl<'a> BatchTask<'a> {
  pub fn new(params: DetectParams) -> Self {
    Self {
      params,
      cancel: Arc::new(AtomicBool::new(false)),
      progress: None,
    }
  }

  pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
    self.cancel = cancel;
    self
  }

  pub fn on_progress(mut self, progress: impl FnMut(&TileProgress) + 'a) -> Self {
    self.progress = Some(Box::new(progress));
    self
  }

  fn report(&mut self, progress: TileProgress) {
    if let Some(callback) = self.progress.as_mut() {
      callback(&progress);
    }
  }
}

impl<'a, I, M, O> Task<I, M, O> for BatchTask<'a>
where
  I: IntoIterator<Item = TileItem>,
  M: Model<Input = InferenceRequest, Output = DetectResult>,
  M::Error: Display,
  O: Render<TileFrame, DetectResult>,
  O::Error: Display,
{
  type Output = BatchSummary;
  type Error = anyhow::Error;

  fn run_task(mut self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error> {
    self.params.validate()?;

    let tiles = input.into_iter();
    let mut summary = BatchSummary {
      total: tiles.size_hint().0,
      ..BatchSummary::default()
    };
    info!("开始批量任务，共 {} 个图块", summary.total);
    let started = Instant::now();

    for (processed, item) in tiles.enumerate() {
      if self.cancel.load(Ordering::Relaxed) {
        warn!("任务已取消，已处理 {} 个图块", processed);
        summary.cancelled = true;
        break;
      }
      summary.total = summary.total.max(processed + 1);

      let (path, outcome) = match item {
        Ok(frame) => {
          let path = frame.path.clone();
          (path, self.process(frame, &model, &output))
        }
        Err((path, e)) => (path, Err(format!("读取失败: {}", e))),
      };

      let progress = match outcome {
        Ok(result) => {
          summary.successful += 1;
          for item in result.items.iter() {
            *summary.class_counts.entry(item.class_id).or_insert(0) += 1;
          }
          TileProgress {
            processed: processed + 1,
            total: summary.total,
            current: path,
            status: TileStatus::Done,
            detections: result.len(),
            error: None,
          }
        }
        Err(message) => {
          summary.failed += 1;
          warn!("图块 {} 处理失败: {}", path.display(), message);
          TileProgress {
            processed: processed + 1,
            total: summary.total,
            current: path,
            status: TileStatus::Failed,
            detections: 0,
            error: Some(message),
          }
        }
      };
      self.report(progress);
    }

    info!(
      "任务完成: 成功 {}, 失败 {}, 共 {}, 检测到 {} 个物体, 耗时 {:.2?}",
      summary.successful,
      summary.failed,
      summary.total,
      summary.detections(),
      started.elapsed()
    );
    Ok(summary)
  }
}

impl BatchTask<'_> {
  fn process<M, O>(&self, frame: TileFrame, model: &M, output: &O) -> Result<DetectResult, String>
  where
    M: Model<Input = InferenceRequest, Output = DetectResult>,
    M::Error: Display,
    O: Render<TileFrame, DetectResult>,
    O::Error: Display,
  {
    let TileFrame { index, path, image } = frame;
    info!("处理第 {} 个图块: {}", index + 1, path.display());

    let request = InferenceRequest::new(image, self.params).map_err(|e| e.to_string())?;
    let now = Instant::now();
    let result = model.infer(&request).map_err(|e| e.to_string())?;
    info!("推理完成，耗时: {:.2?}，检测到 {} 个物体", now.elapsed(), result.len());

    let frame = TileFrame {
      index,
      path,
      image: request.into_image(),
    };
    output
      .render_result(&frame, &result)
      .map_err(|e| format!("输出失败: {}", e))?;
    Ok(result)
  }
}

/// Ctrl-C 置位取消标志，当前图块处理完后退出；30 秒内未退出则强制结束
pub fn install_interrupt_handler(cancel: Arc<AtomicBool>) -> anyhow::Result<()> {
  ctrlc::set_handler(move || {
    info!("收到中断信号，当前图块完成后退出...");
    cancel.store(true, Ordering::Relaxed);
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    error::DetectError,
    frame::TileImage,
    model::{DetectItem, Device},
  };
  use std::{cell::RefCell, convert::Infallible};

  struct CountingModel;

  impl Model for CountingModel {
    type Input = InferenceRequest;
    type Output = DetectResult;
    type Error = DetectError;

    fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
      // 宽度为 1 的图块视为推理失败
      if input.image().width() == 1 {
        return Err(DetectError::InvalidParams("宽度为 1".into()));
      }
      let items = (0..input.image().width())
        .map(|i| DetectItem {
          class_id: i % 2,
          score: 0.5,
          bbox: [0.0, 0.0, 1.0, 1.0],
        })
        .collect::<Vec<_>>();
      Ok(DetectResult {
        items: items.into_boxed_slice(),
      })
    }
  }

  struct NullOutput;

  impl Render<TileFrame, DetectResult> for NullOutput {
    type Error = Infallible;

    fn render_result(&self, _: &TileFrame, _: &DetectResult) -> Result<(), Self::Error> {
      Ok(())
    }
  }

  fn params() -> DetectParams {
    DetectParams {
      confidence: 0.2,
      iou: 0.2,
      max_det: 100,
      input_size: 64,
      device: Device::Cpu,
    }
  }

  fn tile(index: usize, width: u32) -> TileItem {
    Ok(TileFrame {
      index,
      path: PathBuf::from(format!("tile_{}.png", index)),
      image: TileImage::new(vec![0; width as usize * 2 * 3], width, 2, 3).unwrap(),
    })
  }

  #[test]
  fn failures_are_counted_and_batch_continues() {
    let tiles = vec![
      tile(0, 3),
      tile(1, 1),
      Err((PathBuf::from("bad.tif"), InvalidImageError::UnsupportedChannels(2))),
      tile(3, 2),
    ];
    let seen = RefCell::new(Vec::new());
    let summary = BatchTask::new(params())
      .on_progress(|p| seen.borrow_mut().push((p.processed, p.status)))
      .run_task(tiles, CountingModel, NullOutput)
      .unwrap();

    assert_eq!(summary.successful, 2);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.total, 4);
    assert_eq!(summary.class_counts.get(&0), Some(&3));
    assert_eq!(summary.class_counts.get(&1), Some(&2));
    assert_eq!(
      seen.into_inner(),
      vec![
        (1, TileStatus::Done),
        (2, TileStatus::Failed),
        (3, TileStatus::Failed),
        (4, TileStatus::Done),
      ]
    );
  }

  #[test]
  fn cancellation_stops_between_tiles() {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    let summary = BatchTask::new(params())
      .with_cancel(cancel)
      .on_progress(move |_| flag.store(true, Ordering::Relaxed))
      .run_task(vec![tile(0, 2), tile(1, 2), tile(2, 2)], CountingModel, NullOutput)
      .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.successful, 1);
  }

  #[test]
  fn invalid_params_fail_up_front() {
    let mut bad = params();
    bad.max_det = 0;
    assert!(
      BatchTask::new(bad)
        .run_task(vec![tile(0, 2)], CountingModel, NullOutput)
        .is_err()
    );
  }

  #[test]
  fn one_shot_returns_first_result() {
    let result = OneShotTask::new(params())
      .run_task(vec![tile(0, 4), tile(1, 2)], CountingModel, NullOutput)
      .unwrap();
    assert_eq!(result.len(), 4);
  }
}
