// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/main.rs - 批量检测入口
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

mod args;

use std::sync::{Arc, atomic::AtomicBool};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use zonglv::{
  FromUrl,
  config::DetectConfig,
  dispatch::{ArtifactDetector, Dispatcher, ModelArtifact, SidecarWorker, StaticRuntime},
  input::ImageFileInput,
  output::OutputWrapper,
  task::{BatchTask, Task, TileStatus, install_interrupt_handler},
};

fn main() -> Result<()> {
  let args = args::Args::parse();
  init_logging(args.logs_to_stderr());

  let mut config = DetectConfig::load_or_default(args.config.as_deref())?;
  args.apply(&mut config);
  let params = config.params()?;

  info!("模型: {}", args.model);
  info!("图块来源: {}", args.input);
  info!(
    "参数: 置信度 {}, IoU {}, 最大检测数 {}, 输入尺寸 {}, 设备 {}",
    params.confidence, params.iou, params.max_det, params.input_size, params.device
  );

  let artifact = ModelArtifact::from_url(&args.model)?;
  let worker = SidecarWorker::locate(config.worker.as_deref());
  match &worker {
    Some(worker) => info!("外部工作进程: {}", worker.path().display()),
    None => warn!("未找到外部工作进程, 旧格式模型将无法转换或执行"),
  }

  let mut builder = Dispatcher::builder()
    .sidecar(worker)
    .convert_legacy(config.convert_legacy);
  if args.assume_runtime {
    builder = builder.runtime(Arc::new(StaticRuntime(true)));
  }
  let dispatcher = Arc::new(builder.build());
  info!("模型 {} 分派状态: {:?}", artifact.name, dispatcher.state(&artifact));
  let model = ArtifactDetector::new(dispatcher, artifact);

  let input = ImageFileInput::from_url(&args.input)?;
  #[allow(unused_mut)]
  let mut outputs = args
    .output
    .iter()
    .map(OutputWrapper::from_url)
    .collect::<Result<Vec<_>, _>>()?;

  #[cfg(feature = "save_annotated")]
  if config.save_annotated
    && !outputs
      .iter()
      .any(|o| matches!(o, OutputWrapper::AnnotatedImage(_)))
    && let Some(parent) = input.paths().first().and_then(|p| p.parent())
  {
    let directory = parent.join("annotated");
    info!("保存标注图像到: {}", directory.display());
    outputs.push(OutputWrapper::AnnotatedImage(
      zonglv::output::AnnotatedImageOutput::new(directory).line_width(config.line_width),
    ));
  }

  let cancel = Arc::new(AtomicBool::new(false));
  install_interrupt_handler(cancel.clone())?;

  let json_progress = args.json_progress;
  let summary = BatchTask::new(params)
    .with_cancel(cancel)
    .on_progress(move |progress| {
      if json_progress {
        if let Ok(line) = serde_json::to_string(progress) {
          println!("{}", line);
        }
      } else if progress.status == TileStatus::Done {
        info!(
          "进度 {}/{}: {} 检测到 {} 个物体",
          progress.processed,
          progress.total,
          progress.current.display(),
          progress.detections
        );
      }
    })
    .run_task(input, model, outputs)?;

  if json_progress {
    let mut done = serde_json::to_value(&summary)?;
    done["done"] = serde_json::Value::Bool(true);
    println!("{}", done);
  }

  for (class_id, count) in &summary.class_counts {
    info!("类别 {}: {} 个", class_id, count);
  }
  info!(
    "处理完成: 成功 {}, 失败 {}, 共 {}",
    summary.successful, summary.failed, summary.total
  );

  Ok(())
}

fn init_logging(to_stderr: bool) {
  if to_stderr {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
  } else {
    tracing_subscriber::fmt::init();
  }
}
