// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/model/engine.rs - 张量推理引擎适配
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
  borrow::Cow,
  path::{Path, PathBuf},
  sync::Mutex,
};

use ort::{
  ep::{self, ExecutionProvider},
  session::{Session, SessionInputs, builder::GraphOptimizationLevel},
  value::{TensorRef, ValueType},
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::{InferenceError, ModelLoadError},
  frame::PreparedTensor,
  model::{ActiveDevice, Device},
  url_to_path,
};

/// 引擎输出的原始张量
#[derive(Debug, Clone)]
pub struct RawOutput {
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
}

/// 加速器探测
pub trait AcceleratorProbe {
  fn probe_accelerated(&self) -> bool;
}

/// 通过 ONNX Runtime 查询 CUDA 执行器是否可用
#[derive(Debug, Default, Clone, Copy)]
pub struct CudaProbe;

impl AcceleratorProbe for CudaProbe {
  fn probe_accelerated(&self) -> bool {
    match ep::CUDA::default().is_available() {
      Ok(available) => available,
      Err(e) => {
        debug!("查询 CUDA 执行器失败: {}", e);
        false
      }
    }
  }
}

/// 根据请求与探测结果选择设备，探测失败时退回 CPU
pub fn select_device(requested: Device, probe: &dyn AcceleratorProbe) -> ActiveDevice {
  match requested {
    Device::Cpu => ActiveDevice::Cpu,
    Device::Auto | Device::Accelerated => {
      if probe.probe_accelerated() {
        ActiveDevice::Cuda
      } else {
        warn!("CUDA 不可用, 设备 {} 退回 CPU", requested);
        ActiveDevice::Cpu
      }
    }
  }
}

/// 单输入单输出的张量推理引擎
pub trait Engine: Send + Sync {
  /// 声明的输入形状，动态维度为 -1
  fn input_shape(&self) -> &[i64];
  fn output_shape(&self) -> &[i64];
  fn device(&self) -> ActiveDevice;
  fn run(&self, input: &PreparedTensor) -> Result<RawOutput, InferenceError>;

  /// 若输入的空间尺寸固定则返回该尺寸
  fn static_input_size(&self) -> Option<u32> {
    match self.input_shape() {
      [_, _, h, w] if *h > 0 && h == w => Some(*h as u32),
      _ => None,
    }
  }
}

/// 声明形状中的动态维度 (<= 0) 可匹配任意值
pub fn check_input_shape(declared: &[i64], actual: &[usize]) -> Result<(), InferenceError> {
  let matches = declared.len() == actual.len()
    && declared
      .iter()
      .zip(actual)
      .all(|(&d, &a)| d <= 0 || d as usize == a);

  if matches {
    Ok(())
  } else {
    Err(InferenceError::ShapeMismatch {
      expected: declared.to_vec(),
      actual: actual.to_vec(),
    })
  }
}

fn is_out_of_memory(message: &str) -> bool {
  let lower = message.to_ascii_lowercase();
  lower.contains("out of memory") || lower.contains("failed to allocate") || lower.contains("bad_alloc")
}

fn backend_error(message: String) -> InferenceError {
  if is_out_of_memory(&message) {
    InferenceError::OutOfMemory(message)
  } else {
    InferenceError::Backend(message)
  }
}

pub struct OnnxEngine {
  session: Mutex<Session>,
  input_name: String,
  output_name: String,
  input_shape: Vec<i64>,
  output_shape: Vec<i64>,
  device: ActiveDevice,
  path: PathBuf,
}

impl std::fmt::Debug for OnnxEngine {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OnnxEngine")
      .field("path", &self.path)
      .field("input_name", &self.input_name)
      .field("input_shape", &self.input_shape)
      .field("output_name", &self.output_name)
      .field("output_shape", &self.output_shape)
      .field("device", &self.device)
      .finish()
  }
}

impl OnnxEngine {
  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Engine for OnnxEngine {
  fn input_shape(&self) -> &[i64] {
    &self.input_shape
  }

  fn output_shape(&self) -> &[i64] {
    &self.output_shape
  }

  fn device(&self) -> ActiveDevice {
    self.device
  }

  fn run(&self, input: &PreparedTensor) -> Result<RawOutput, InferenceError> {
    let shape = input.shape();
    check_input_shape(&self.input_shape, &shape)?;

    let dims: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
    let tensor = TensorRef::from_array_view((dims, input.data()))
      .map_err(|e| InferenceError::Backend(format!("创建输入张量失败: {}", e)))?;

    let mut session = self
      .session
      .lock()
      .map_err(|e| InferenceError::Backend(format!("推理会话锁被污染: {}", e)))?;

    let inputs: SessionInputs<'_, '_, 0> =
      SessionInputs::ValueMap(vec![(Cow::Borrowed(self.input_name.as_str()), tensor.into())]);
    let outputs = session.run(inputs).map_err(|e| {
      error!("推理失败: {}", e);
      backend_error(e.to_string())
    })?;

    let (out_shape, data) = outputs[self.output_name.as_str()]
      .try_extract_tensor::<f32>()
      .map_err(|e| InferenceError::MalformedOutput(format!("无法提取输出张量: {}", e)))?;

    let shape: Vec<usize> = out_shape.iter().map(|&d| d.max(0) as usize).collect();
    debug!("推理输出形状: {:?}", shape);

    Ok(RawOutput {
      shape,
      data: data.to_vec(),
    })
  }
}

impl Drop for OnnxEngine {
  fn drop(&mut self) {
    debug!("释放推理会话: {}", self.path.display());
  }
}

pub struct OnnxEngineBuilder {
  model_path: PathBuf,
  device: Device,
}

const ONNX_SCHEME: &str = "onnx";

impl FromUrl for OnnxEngineBuilder {
  type Error = ModelLoadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != ONNX_SCHEME {
      return Err(ModelLoadError::PathError(format!(
        "模型路径必须使用 {} 方案",
        ONNX_SCHEME
      )));
    }

    Ok(OnnxEngineBuilder::new(url_to_path(url)))
  }
}

impl FromUrlWithScheme for OnnxEngineBuilder {
  const SCHEME: &'static str = ONNX_SCHEME;
}

fn tensor_shape(value_type: &ValueType) -> Option<Vec<i64>> {
  match value_type {
    ValueType::Tensor { shape, .. } => Some(shape.iter().copied().collect()),
    _ => None,
  }
}

impl OnnxEngineBuilder {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      device: Device::Auto,
    }
  }

  pub fn device(mut self, device: Device) -> Self {
    self.device = device;
    self
  }

  pub fn build(self) -> Result<OnnxEngine, ModelLoadError> {
    self.build_with_probe(&CudaProbe)
  }

  pub fn build_with_probe(self, probe: &dyn AcceleratorProbe) -> Result<OnnxEngine, ModelLoadError> {
    let path = self.model_path;
    if !path.is_file() {
      return Err(ModelLoadError::NotFound(path));
    }

    info!("加载模型文件: {}", path.display());
    let model_data = std::fs::read(&path).map_err(|source| ModelLoadError::Unreadable {
      path: path.clone(),
      source,
    })?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    let invalid = |reason: String| ModelLoadError::InvalidGraph {
      path: path.clone(),
      reason,
    };

    let mut device = select_device(self.device, probe);
    let session = match device {
      ActiveDevice::Cuda => match commit_session(&model_data, true) {
        Ok(session) => session,
        Err(e) => {
          warn!("CUDA 会话创建失败, 退回 CPU: {}", e);
          device = ActiveDevice::Cpu;
          commit_session(&model_data, false).map_err(invalid)?
        }
      },
      ActiveDevice::Cpu => commit_session(&model_data, false).map_err(invalid)?,
    };

    let inputs = session.inputs();
    if inputs.len() != 1 {
      error!("预期模型输入数量为 1, 实际为 {}", inputs.len());
      return Err(invalid(format!(
        "预期模型输入数量为 1, 实际为 {}",
        inputs.len()
      )));
    }
    let input_name = inputs[0].name().to_string();
    let input_shape = tensor_shape(inputs[0].dtype())
      .ok_or_else(|| invalid(format!("输入 {} 不是张量", input_name)))?;

    let output = session
      .outputs()
      .first()
      .ok_or_else(|| invalid("模型没有输出".to_string()))?;
    let output_name = output.name().to_string();
    let output_shape = tensor_shape(output.dtype())
      .ok_or_else(|| invalid(format!("输出 {} 不是张量", output_name)))?;

    debug!("模型输入: {} {:?}", input_name, input_shape);
    debug!("模型输出: {} {:?}", output_name, output_shape);
    info!("模型加载完成, 设备: {}", device);

    Ok(OnnxEngine {
      session: Mutex::new(session),
      input_name,
      output_name,
      input_shape,
      output_shape,
      device,
      path,
    })
  }
}

fn commit_session(model_data: &[u8], cuda: bool) -> Result<Session, String> {
  let builder = Session::builder()
    .map_err(|e| e.to_string())?
    .with_optimization_level(GraphOptimizationLevel::Level3)
    .map_err(|e| e.to_string())?;

  let mut builder = if cuda {
    builder
      .with_execution_providers([ep::CUDA::default().build().error_on_failure()])
      .map_err(|e| e.to_string())?
  } else {
    builder
  };

  builder
    .commit_from_memory(model_data)
    .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  struct FixedProbe(bool);

  impl AcceleratorProbe for FixedProbe {
    fn probe_accelerated(&self) -> bool {
      self.0
    }
  }

  #[test]
  fn cpu_request_never_probes() {
    struct PanicProbe;
    impl AcceleratorProbe for PanicProbe {
      fn probe_accelerated(&self) -> bool {
        panic!("不应探测");
      }
    }
    assert_eq!(select_device(Device::Cpu, &PanicProbe), ActiveDevice::Cpu);
  }

  #[test]
  fn unavailable_accelerator_falls_back_to_cpu() {
    assert_eq!(
      select_device(Device::Accelerated, &FixedProbe(false)),
      ActiveDevice::Cpu
    );
    assert_eq!(select_device(Device::Auto, &FixedProbe(false)), ActiveDevice::Cpu);
    assert_eq!(select_device(Device::Auto, &FixedProbe(true)), ActiveDevice::Cuda);
  }

  #[test]
  fn dynamic_dimensions_match_anything() {
    assert!(check_input_shape(&[-1, 3, -1, -1], &[1, 3, 1280, 1280]).is_ok());
    assert!(check_input_shape(&[1, 3, 640, 640], &[1, 3, 640, 640]).is_ok());
    assert!(matches!(
      check_input_shape(&[1, 3, 640, 640], &[1, 3, 1280, 1280]),
      Err(InferenceError::ShapeMismatch { .. })
    ));
    assert!(check_input_shape(&[1, 3, 640], &[1, 3, 640, 640]).is_err());
  }

  #[test]
  fn allocation_failures_map_to_out_of_memory() {
    assert!(matches!(
      backend_error("CUDA failure 2: out of memory".into()),
      InferenceError::OutOfMemory(_)
    ));
    assert!(matches!(
      backend_error("invalid node".into()),
      InferenceError::Backend(_)
    ));
  }

  #[test]
  fn missing_model_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.onnx");
    assert!(matches!(
      OnnxEngineBuilder::new(&missing).device(Device::Cpu).build(),
      Err(ModelLoadError::NotFound(_))
    ));
  }

  #[test]
  fn garbage_model_is_invalid_graph() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.onnx");
    std::fs::write(&path, b"not a model").unwrap();
    let result = OnnxEngineBuilder::new(&path)
      .device(Device::Cpu)
      .build_with_probe(&FixedProbe(false));
    assert!(matches!(result, Err(ModelLoadError::InvalidGraph { .. })));
  }

  #[test]
  fn builder_requires_onnx_scheme() {
    let url = Url::parse("pt:///models/palm.pt").unwrap();
    assert!(OnnxEngineBuilder::from_url(&url).is_err());
    let url = Url::parse("onnx:///models/palm.onnx").unwrap();
    assert!(OnnxEngineBuilder::from_url(&url).is_ok());
  }
}
