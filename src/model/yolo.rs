// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/model/yolo.rs - YOLO 检测模型
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

use std::sync::Arc;

use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl,
  error::{DetectError, ModelLoadError},
  model::{
    DetectResult, Device, InferenceRequest, Model,
    decode::{OutputLayout, decode},
    engine::{Engine, OnnxEngineBuilder},
    letterbox::Preprocessor,
  },
};

/// 原生张量引擎上的检测器：预处理、推理、解码
pub struct YoloDetector {
  engine: Arc<dyn Engine>,
  layout: Option<OutputLayout>,
}

impl YoloDetector {
  pub fn new(engine: Arc<dyn Engine>) -> Result<Self, DetectError> {
    let layout = OutputLayout::from_declared(engine.output_shape(), engine.static_input_size())?;
    if let Some(layout) = &layout {
      debug!(
        "输出布局: {} 个候选框, {} 个类别, 逐通道 {}",
        layout.candidates,
        layout.num_classes(),
        layout.channels_first
      );
    }
    Ok(Self { engine, layout })
  }

  /// 显式指定输出布局，覆盖按形状推断的结果
  pub fn with_layout(mut self, layout: OutputLayout) -> Self {
    self.layout = Some(layout);
    self
  }

  pub fn engine(&self) -> &Arc<dyn Engine> {
    &self.engine
  }
}

impl Model for YoloDetector {
  type Input = InferenceRequest;
  type Output = DetectResult;
  type Error = DetectError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let params = input.params();
    let target = match self.engine.static_input_size() {
      Some(size) if size != params.input_size => {
        debug!("模型输入尺寸固定为 {}, 忽略请求的 {}", size, params.input_size);
        size
      }
      _ => params.input_size,
    };

    let tensor = Preprocessor::new(target).prepare(input.image())?;
    let raw = self.engine.run(&tensor)?;

    let layout = match self.layout {
      Some(layout) => layout,
      None => OutputLayout::from_shape_for_input(&raw.shape, target)?,
    };

    let items = decode(&raw, &layout, tensor.letterbox(), params)?;
    Ok(DetectResult {
      items: items.into_boxed_slice(),
    })
  }
}

pub struct YoloDetectorBuilder {
  engine: OnnxEngineBuilder,
}

impl FromUrl for YoloDetectorBuilder {
  type Error = ModelLoadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    Ok(Self {
      engine: OnnxEngineBuilder::from_url(url)?,
    })
  }
}

impl YoloDetectorBuilder {
  pub fn device(mut self, device: Device) -> Self {
    self.engine = self.engine.device(device);
    self
  }

  pub fn build(self) -> Result<YoloDetector, DetectError> {
    let engine = self.engine.build()?;
    info!("检测器就绪, 设备: {}", engine.device());
    YoloDetector::new(Arc::new(engine))
  }
}
