// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/dispatch.rs - 按模型格式分派检测请求
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

mod artifact;
mod convert;
mod external;
mod runtime;
mod sidecar;

pub use self::{
  artifact::{ArtifactFormat, ModelArtifact, ModelRegistry, NoopRegistry, RegistryError},
  convert::{ConversionCache, ConversionState, ModelConverter, SidecarConverter},
  external::{ExternalExecutor, SidecarExecutor, UnavailableExecutor},
  runtime::{RuntimeAvailability, SidecarRuntime, StaticRuntime},
  sidecar::SidecarWorker,
};

use std::{
  collections::{HashMap, HashSet},
  path::{Path, PathBuf},
  sync::{Arc, Mutex},
};

use tracing::{debug, info, warn};

use crate::{
  error::{DetectError, ModelLoadError},
  model::{
    DetectParams, DetectResult, Device, InferenceRequest, Model, YoloDetector,
    engine::{Engine, OnnxEngineBuilder},
  },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
  NativeReady,
  NeedsConversion,
  LegacyOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
  Native,
  External,
}

/// 单次请求的分派结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchDecision {
  pub engine: EngineKind,
  pub path: PathBuf,
}

/// 加载原生张量引擎
pub trait EngineLoader: Send + Sync {
  fn load(&self, path: &Path, device: Device) -> Result<Arc<dyn Engine>, ModelLoadError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxLoader;

impl EngineLoader for OnnxLoader {
  fn load(&self, path: &Path, device: Device) -> Result<Arc<dyn Engine>, ModelLoadError> {
    let engine = OnnxEngineBuilder::new(path).device(device).build()?;
    Ok(Arc::new(engine))
  }
}

pub struct Dispatcher {
  loader: Arc<dyn EngineLoader>,
  conversions: Option<ConversionCache>,
  executor: Arc<dyn ExternalExecutor>,
  runtime: Arc<dyn RuntimeAvailability>,
  registry: Arc<dyn ModelRegistry>,
  convert_legacy: bool,
  detectors: Mutex<HashMap<(PathBuf, Device), Arc<YoloDetector>>>,
  recorded: Mutex<HashSet<PathBuf>>,
}

impl Dispatcher {
  pub fn builder() -> DispatcherBuilder {
    DispatcherBuilder::default()
  }

  /// 当前请求对应的状态，不产生副作用
  pub fn state(&self, artifact: &ModelArtifact) -> DispatchState {
    self.classify(artifact).0
  }

  /// 状态与可直接使用的转换产物。本进程的转换记录优先于磁盘上的文件
  fn classify(&self, artifact: &ModelArtifact) -> (DispatchState, Option<PathBuf>) {
    if artifact.format == ArtifactFormat::NativeTensor {
      return (DispatchState::NativeReady, None);
    }

    // 先查磁盘再查记录：若此后仍无记录，该文件早于本进程的任何转换
    let on_disk = artifact.materialized_sibling();
    let Some(conversions) = &self.conversions else {
      return match on_disk {
        Some(sibling) => (DispatchState::NativeReady, Some(sibling)),
        None => (DispatchState::LegacyOnly, None),
      };
    };

    match conversions.state(&artifact.path) {
      Some(ConversionState::Converted(sibling)) => (DispatchState::NativeReady, Some(sibling)),
      Some(ConversionState::Failed) => (DispatchState::LegacyOnly, None),
      Some(ConversionState::InProgress) => (DispatchState::NeedsConversion, None),
      None => match on_disk {
        Some(sibling) => (DispatchState::NativeReady, Some(sibling)),
        None if self.convert_legacy && self.runtime.runtime_available() => {
          (DispatchState::NeedsConversion, None)
        }
        None => (DispatchState::LegacyOnly, None),
      },
    }
  }

  /// 转换产物只回写一次
  fn record_sibling(&self, artifact: &ModelArtifact, sibling: &Path) {
    if artifact.sibling.as_deref() == Some(sibling) {
      return;
    }
    let mut recorded = self.recorded.lock().unwrap_or_else(|e| e.into_inner());
    if !recorded.insert(artifact.path.clone()) {
      return;
    }
    match self.registry.record_sibling(artifact, sibling) {
      Ok(()) => debug!("已记录转换产物: {}", sibling.display()),
      Err(e) => warn!("记录转换产物失败: {}", e),
    }
  }

  pub fn resolve(&self, artifact: &ModelArtifact, params: &DetectParams) -> DispatchDecision {
    let (state, sibling) = self.classify(artifact);
    debug!("模型 {} 分派状态: {:?}", artifact.name, state);

    match state {
      DispatchState::NativeReady => {
        let path = match sibling {
          Some(sibling) => {
            self.record_sibling(artifact, &sibling);
            sibling
          }
          None => artifact.path.clone(),
        };
        DispatchDecision {
          engine: EngineKind::Native,
          path,
        }
      }
      DispatchState::NeedsConversion => {
        let converted = self.conversions.as_ref().map(|c| {
          c.get_or_convert(&artifact.path, &artifact.sibling_target(), params.input_size)
        });
        match converted {
          Some(Ok(sibling)) => {
            self.record_sibling(artifact, &sibling);
            DispatchDecision {
              engine: EngineKind::Native,
              path: sibling,
            }
          }
          Some(Err(e)) => {
            warn!("模型 {} 转换失败, 改用外部执行器: {}", artifact.name, e);
            self.legacy(artifact)
          }
          None => self.legacy(artifact),
        }
      }
      DispatchState::LegacyOnly => self.legacy(artifact),
    }
  }

  fn legacy(&self, artifact: &ModelArtifact) -> DispatchDecision {
    DispatchDecision {
      engine: EngineKind::External,
      path: artifact.path.clone(),
    }
  }

  /// 同一模型与设备只加载一次
  pub fn detector(&self, path: &Path, device: Device) -> Result<Arc<YoloDetector>, DetectError> {
    let mut detectors = self.detectors.lock().unwrap_or_else(|e| e.into_inner());
    let key = (path.to_path_buf(), device);
    if let Some(detector) = detectors.get(&key) {
      return Ok(detector.clone());
    }

    info!("加载原生模型: {} ({})", path.display(), device);
    let engine = self.loader.load(path, device)?;
    let detector = Arc::new(YoloDetector::new(engine)?);
    detectors.insert(key, detector.clone());
    Ok(detector)
  }

  pub fn detect(
    &self,
    artifact: &ModelArtifact,
    request: &InferenceRequest,
  ) -> Result<DetectResult, DetectError> {
    let decision = self.resolve(artifact, request.params());
    match decision.engine {
      EngineKind::Native => {
        let detector = self.detector(&decision.path, request.params().device)?;
        detector.infer(request)
      }
      EngineKind::External => Ok(self.executor.execute(
        &decision.path,
        request.image(),
        request.params(),
      )?),
    }
  }
}

pub struct DispatcherBuilder {
  loader: Arc<dyn EngineLoader>,
  converter: Option<Arc<dyn ModelConverter>>,
  executor: Arc<dyn ExternalExecutor>,
  runtime: Arc<dyn RuntimeAvailability>,
  registry: Arc<dyn ModelRegistry>,
  convert_legacy: bool,
}

impl Default for DispatcherBuilder {
  fn default() -> Self {
    Self {
      loader: Arc::new(OnnxLoader),
      converter: None,
      executor: Arc::new(UnavailableExecutor("未配置外部执行器".to_string())),
      runtime: Arc::new(StaticRuntime(false)),
      registry: Arc::new(NoopRegistry),
      convert_legacy: true,
    }
  }
}

impl DispatcherBuilder {
  pub fn loader(mut self, loader: Arc<dyn EngineLoader>) -> Self {
    self.loader = loader;
    self
  }

  pub fn converter(mut self, converter: Arc<dyn ModelConverter>) -> Self {
    self.converter = Some(converter);
    self
  }

  pub fn executor(mut self, executor: Arc<dyn ExternalExecutor>) -> Self {
    self.executor = executor;
    self
  }

  pub fn runtime(mut self, runtime: Arc<dyn RuntimeAvailability>) -> Self {
    self.runtime = runtime;
    self
  }

  pub fn registry(mut self, registry: Arc<dyn ModelRegistry>) -> Self {
    self.registry = registry;
    self
  }

  pub fn convert_legacy(mut self, enabled: bool) -> Self {
    self.convert_legacy = enabled;
    self
  }

  /// 外部工作进程同时负责转换、旧格式执行与运行时判断
  pub fn sidecar(self, worker: Option<SidecarWorker>) -> Self {
    let runtime = Arc::new(SidecarRuntime::new(worker.clone()));
    match worker {
      Some(worker) => self
        .converter(Arc::new(SidecarConverter::new(worker.clone())))
        .executor(Arc::new(SidecarExecutor::new(worker)))
        .runtime(runtime),
      None => self.runtime(runtime),
    }
  }

  pub fn build(self) -> Dispatcher {
    Dispatcher {
      loader: self.loader,
      conversions: self.converter.map(ConversionCache::new),
      executor: self.executor,
      runtime: self.runtime,
      registry: self.registry,
      convert_legacy: self.convert_legacy,
      detectors: Mutex::new(HashMap::new()),
      recorded: Mutex::new(HashSet::new()),
    }
  }
}

/// 绑定到某个模型制品的检测器
pub struct ArtifactDetector {
  dispatcher: Arc<Dispatcher>,
  artifact: ModelArtifact,
}

impl ArtifactDetector {
  pub fn new(dispatcher: Arc<Dispatcher>, artifact: ModelArtifact) -> Self {
    Self {
      dispatcher,
      artifact,
    }
  }

  pub fn artifact(&self) -> &ModelArtifact {
    &self.artifact
  }
}

impl Model for ArtifactDetector {
  type Input = InferenceRequest;
  type Output = DetectResult;
  type Error = DetectError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.dispatcher.detect(&self.artifact, input)
  }
}
