// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/args.rs - 项目参数配置
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

use clap::Parser;
use url::Url;
use zonglv::{config::DetectConfig, model::Device};

/// Zonglv 批量图块检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型路径
  /// 支持格式:
  /// - 原生: onnx:///path/model.onnx
  /// - 旧格式: pt:///path/model.pt
  /// - 按扩展名判断: file:///path/model.pt
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 图块来源（单个图像文件或目录）
  /// 例如 image:///data/tiles 或 file:///data/tiles/blok_a.tif
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 输出，可重复
  /// - 检测记录: jsonl:///data/out/detections.jsonl
  /// - 标注图像: image:///data/out/annotated?line_width=3
  #[arg(long, value_name = "OUTPUT")]
  pub output: Vec<Url>,

  /// JSON 配置文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub conf: Option<f32>,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub iou: Option<f32>,

  /// 每个图块的最大检测数
  #[arg(long, value_name = "COUNT")]
  pub max_det: Option<usize>,

  /// 模型输入尺寸
  #[arg(long, value_name = "PIXELS")]
  pub imgsz: Option<u32>,

  /// 计算设备 (auto, cpu, cuda)
  #[arg(long, value_name = "DEVICE")]
  pub device: Option<Device>,

  /// 外部工作进程路径
  #[arg(long, value_name = "FILE")]
  pub worker: Option<PathBuf>,

  /// 不转换旧格式模型，直接使用外部执行器
  #[arg(long)]
  pub no_convert: bool,

  /// 视为已安装转换运行时
  #[arg(long)]
  pub assume_runtime: bool,

  /// 以 JSON 行在标准输出报告进度
  #[arg(long)]
  pub json_progress: bool,
}

impl Args {
  /// 标准输出被 JSON 进度占用时，日志写到标准错误
  pub fn logs_to_stderr(&self) -> bool {
    self.json_progress
  }

  /// 命令行参数覆盖配置文件
  pub fn apply(&self, config: &mut DetectConfig) {
    if let Some(conf) = self.conf {
      config.conf = conf;
    }
    if let Some(iou) = self.iou {
      config.iou = iou;
    }
    if let Some(max_det) = self.max_det {
      config.max_det = max_det;
    }
    if let Some(imgsz) = self.imgsz {
      config.imgsz = imgsz;
    }
    if let Some(device) = self.device {
      config.device = device;
    }
    if let Some(worker) = &self.worker {
      config.worker = Some(worker.clone());
    }
    if self.no_convert {
      config.convert_legacy = false;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn flags_override_config() {
    let args = Args::parse_from([
      "zonglv",
      "--model",
      "pt:///m/palm.pt",
      "--input",
      "image:///tiles",
      "--conf",
      "0.4",
      "--device",
      "cpu",
      "--no-convert",
    ]);
    let mut config = DetectConfig::default();
    args.apply(&mut config);

    assert!((config.conf - 0.4).abs() < 1e-6);
    assert_eq!(config.device, Device::Cpu);
    assert!(!config.convert_legacy);
    assert_eq!(config.imgsz, DetectConfig::default().imgsz);
  }

  #[test]
  fn json_progress_moves_logs_to_stderr() {
    let base = ["zonglv", "--model", "onnx:///m/palm.onnx", "--input", "image:///tiles"];
    assert!(!Args::parse_from(base).logs_to_stderr());
    let json = Args::parse_from(base.iter().copied().chain(["--json-progress"]));
    assert!(json.logs_to_stderr());
  }
}
