// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/dispatch/runtime.rs - 运行时可用性判断
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

use crate::dispatch::sidecar::SidecarWorker;

/// 模型转换所需的运行时是否已安装
pub trait RuntimeAvailability: Send + Sync {
  fn runtime_available(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct StaticRuntime(pub bool);

impl RuntimeAvailability for StaticRuntime {
  fn runtime_available(&self) -> bool {
    self.0
  }
}

/// 以打包的工作进程是否存在作为判断依据
#[derive(Debug, Clone)]
pub struct SidecarRuntime {
  worker: Option<SidecarWorker>,
}

impl SidecarRuntime {
  pub fn new(worker: Option<SidecarWorker>) -> Self {
    Self { worker }
  }
}

impl RuntimeAvailability for SidecarRuntime {
  fn runtime_available(&self) -> bool {
    self
      .worker
      .as_ref()
      .is_some_and(SidecarWorker::bundle_installed)
  }
}
