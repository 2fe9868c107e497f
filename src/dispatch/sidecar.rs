// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/dispatch/sidecar.rs - 外部工作进程定位与启动
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
  env::consts::EXE_SUFFIX,
  path::{Path, PathBuf},
  process::Command,
};

use tracing::debug;

const WORKER_NAME: &str = "infer_worker";
const WORKER_SCRIPT: &str = "infer_worker.py";
const WORKER_ENV: &str = "ZONGLV_WORKER";
/// 完整运行时包中的工作进程远大于该值
const BUNDLE_MIN_SIZE: u64 = 1_000_000;

/// 外部工作进程（打包的二进制文件或 Python 脚本）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarWorker {
  path: PathBuf,
  script: bool,
}

impl SidecarWorker {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    let path = path.into();
    let script = path
      .extension()
      .is_some_and(|ext| ext.eq_ignore_ascii_case("py"));
    Self { path, script }
  }

  /// 依次查找：显式路径、环境变量、可执行文件旁、当前目录
  pub fn locate(configured: Option<&Path>) -> Option<Self> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = configured {
      candidates.push(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(WORKER_ENV) {
      candidates.push(PathBuf::from(path));
    }

    let binary = format!("{}{}", WORKER_NAME, EXE_SUFFIX);
    if let Some(dir) = std::env::current_exe()
      .ok()
      .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
      candidates.push(dir.join(&binary));
      candidates.push(dir.join("binaries").join(&binary));
      candidates.push(dir.join("python_ai").join(WORKER_SCRIPT));
    }
    if let Ok(cwd) = std::env::current_dir() {
      candidates.push(cwd.join("python_ai").join(WORKER_SCRIPT));
    }

    for candidate in candidates {
      debug!("查找工作进程: {}", candidate.display());
      if candidate.is_file() {
        return Some(SidecarWorker::new(candidate));
      }
    }
    None
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn is_script(&self) -> bool {
    self.script
  }

  /// 是否安装了打包好的运行时
  pub fn bundle_installed(&self) -> bool {
    !self.script
      && std::fs::metadata(&self.path)
        .map(|m| m.is_file() && m.len() > BUNDLE_MIN_SIZE)
        .unwrap_or(false)
  }

  pub fn command(&self) -> Command {
    if self.script {
      let mut cmd = Command::new("python");
      cmd.arg("-u").arg(&self.path);
      cmd.env("PYTHONUNBUFFERED", "1");
      cmd
    } else {
      Command::new(&self.path)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn python_script_runs_through_interpreter() {
    let worker = SidecarWorker::new("/opt/zonglv/python_ai/infer_worker.py");
    assert!(worker.is_script());
    let cmd = worker.command();
    assert_eq!(cmd.get_program(), "python");
    let args: Vec<_> = cmd.get_args().collect();
    assert_eq!(args[0], "-u");
  }

  #[test]
  fn small_binary_is_not_a_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("infer_worker");
    std::fs::write(&path, vec![0u8; 1024]).unwrap();
    assert!(!SidecarWorker::new(&path).bundle_installed());

    std::fs::write(&path, vec![0u8; 1_000_001]).unwrap();
    assert!(SidecarWorker::new(&path).bundle_installed());
  }

  #[test]
  fn configured_path_wins() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worker.py");
    std::fs::write(&path, b"print()").unwrap();
    assert_eq!(
      SidecarWorker::locate(Some(&path)).map(|w| w.path().to_path_buf()),
      Some(path)
    );
  }
}
