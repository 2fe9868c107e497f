// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/bin/simple_oneshot.rs - 单图块原生模型检测
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

use anyhow::Result;
use clap::Parser;
use url::Url;

use zonglv::{
  FromUrl,
  config::DetectConfig,
  input::ImageFileInput,
  model::{Device, YoloDetectorBuilder},
  output::OutputWrapper,
  task::{OneShotTask, Task},
};
use tracing::info;

/// Zonglv 单图块检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// ONNX 模型文件路径
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图块
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 计算设备
  #[arg(long, value_name = "DEVICE", default_value = "auto")]
  pub device: Device,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let mut config = DetectConfig::default();
  config.device = args.device;
  let params = config.params()?;

  let input = ImageFileInput::from_url(&args.input)?;
  let model = YoloDetectorBuilder::from_url(&args.model)?
    .device(args.device)
    .build()?;
  let output = OutputWrapper::from_url(&args.output)?;

  let result = OneShotTask::new(params).run_task(input, model, output)?;
  println!("{}", serde_json::to_string(&result.items)?);

  Ok(())
}
