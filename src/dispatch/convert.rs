// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/dispatch/convert.rs - 模型格式转换
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
  collections::HashMap,
  path::{Path, PathBuf},
  process::Stdio,
  sync::{Arc, Mutex, TryLockError},
  time::Instant,
};

use tracing::{debug, info, warn};

use crate::{dispatch::sidecar::SidecarWorker, error::ConversionError};

/// 旧格式 -> 原生张量格式
pub trait ModelConverter: Send + Sync {
  fn convert(&self, legacy: &Path, target: &Path, input_size: u32) -> Result<(), ConversionError>;
}

/// 调用外部工作进程的 `--convert` 子命令
#[derive(Debug, Clone)]
pub struct SidecarConverter {
  worker: SidecarWorker,
}

impl SidecarConverter {
  pub fn new(worker: SidecarWorker) -> Self {
    Self { worker }
  }
}

/// 保留 stderr 末尾若干行作为错误信息
fn tail_lines(text: &str, n: usize) -> String {
  let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
  let start = lines.len().saturating_sub(n);
  lines[start..].join("\n")
}

impl ModelConverter for SidecarConverter {
  fn convert(&self, legacy: &Path, target: &Path, input_size: u32) -> Result<(), ConversionError> {
    let output = self
      .worker
      .command()
      .arg("--convert")
      .arg(legacy)
      .arg(target)
      .arg(input_size.to_string())
      .stdin(Stdio::null())
      .output()
      .map_err(ConversionError::Spawn)?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
      debug!("[convert] {}", line);
    }

    if !output.status.success() {
      return Err(ConversionError::Failed {
        code: output.status.code(),
        message: tail_lines(&stderr, 5),
      });
    }
    Ok(())
  }
}

type ConversionSlot = Arc<Mutex<Option<Result<PathBuf, String>>>>;

/// 某个旧格式模型在本进程中的转换记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionState {
  InProgress,
  Converted(PathBuf),
  Failed,
}

/// 按旧格式路径加锁的转换缓存，同一路径至多转换一次
pub struct ConversionCache {
  converter: Arc<dyn ModelConverter>,
  slots: Mutex<HashMap<PathBuf, ConversionSlot>>,
}

impl ConversionCache {
  pub fn new(converter: Arc<dyn ModelConverter>) -> Self {
    Self {
      converter,
      slots: Mutex::new(HashMap::new()),
    }
  }

  fn slot(&self, legacy: &Path) -> ConversionSlot {
    let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
    slots.entry(legacy.to_path_buf()).or_default().clone()
  }

  /// 不等待进行中的转换；没有任何转换记录时返回 None
  pub fn state(&self, legacy: &Path) -> Option<ConversionState> {
    let slot = {
      let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
      slots.get(legacy)?.clone()
    };
    let guard = match slot.try_lock() {
      Ok(guard) => guard,
      Err(TryLockError::Poisoned(e)) => e.into_inner(),
      Err(TryLockError::WouldBlock) => return Some(ConversionState::InProgress),
    };
    // 槽位已建立但尚未加锁的转换同样视为进行中
    Some(match guard.as_ref() {
      None => ConversionState::InProgress,
      Some(Ok(path)) => ConversionState::Converted(path.clone()),
      Some(Err(_)) => ConversionState::Failed,
    })
  }

  /// 已成功转换的产物路径
  pub fn converted(&self, legacy: &Path) -> Option<PathBuf> {
    match self.state(legacy)? {
      ConversionState::Converted(path) => Some(path),
      _ => None,
    }
  }

  /// 此前的转换是否已失败
  pub fn failed(&self, legacy: &Path) -> bool {
    matches!(self.state(legacy), Some(ConversionState::Failed))
  }

  /// 并发调用时只有第一个会真正执行转换，其余等待其结果
  pub fn get_or_convert(
    &self,
    legacy: &Path,
    target: &Path,
    input_size: u32,
  ) -> Result<PathBuf, ConversionError> {
    let slot = self.slot(legacy);
    let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());

    if let Some(done) = guard.as_ref() {
      debug!("复用转换结果: {}", legacy.display());
      return done.clone().map_err(ConversionError::PreviouslyFailed);
    }

    info!("转换模型: {} -> {}", legacy.display(), target.display());
    let preexisting = target.exists();
    let start = Instant::now();
    let result = self
      .converter
      .convert(legacy, target, input_size)
      .and_then(|()| {
        if target.is_file() {
          Ok(target.to_path_buf())
        } else {
          Err(ConversionError::MissingOutput(target.to_path_buf()))
        }
      });

    match &result {
      Ok(_) => info!("模型转换完成, 耗时: {:.2?}", start.elapsed()),
      Err(e) => {
        warn!("模型转换失败: {}", e);
        // 失败的转换留下的半成品不能被当作可用产物
        if !preexisting
          && target.exists()
          && let Err(e) = std::fs::remove_file(target)
        {
          warn!("删除未完成的转换产物 {} 失败: {}", target.display(), e);
        }
      }
    }

    *guard = Some(result.as_ref().map(Clone::clone).map_err(ToString::to_string));
    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct WritingConverter {
    calls: AtomicUsize,
    fail: bool,
  }

  impl ModelConverter for WritingConverter {
    fn convert(&self, _legacy: &Path, target: &Path, _input_size: u32) -> Result<(), ConversionError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if self.fail {
        return Err(ConversionError::Failed {
          code: Some(1),
          message: "no torch".into(),
        });
      }
      std::fs::write(target, b"graph").map_err(ConversionError::Spawn)
    }
  }

  #[test]
  fn success_is_cached() {
    let dir = tempfile::tempdir().unwrap();
    let legacy = dir.path().join("m.pt");
    let target = dir.path().join("m.onnx");
    let converter = Arc::new(WritingConverter {
      calls: AtomicUsize::new(0),
      fail: false,
    });
    let cache = ConversionCache::new(converter.clone());

    assert_eq!(cache.get_or_convert(&legacy, &target, 640).unwrap(), target);
    assert_eq!(cache.get_or_convert(&legacy, &target, 640).unwrap(), target);
    assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.converted(&legacy), Some(target));
  }

  #[test]
  fn failure_is_sticky() {
    let dir = tempfile::tempdir().unwrap();
    let legacy = dir.path().join("m.pt");
    let target = dir.path().join("m.onnx");
    let converter = Arc::new(WritingConverter {
      calls: AtomicUsize::new(0),
      fail: true,
    });
    let cache = ConversionCache::new(converter.clone());

    assert!(matches!(
      cache.get_or_convert(&legacy, &target, 640),
      Err(ConversionError::Failed { .. })
    ));
    assert!(matches!(
      cache.get_or_convert(&legacy, &target, 640),
      Err(ConversionError::PreviouslyFailed(_))
    ));
    assert!(cache.failed(&legacy));
    assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn failed_attempt_removes_its_partial_output() {
    struct PartialConverter;
    impl ModelConverter for PartialConverter {
      fn convert(&self, _: &Path, target: &Path, _: u32) -> Result<(), ConversionError> {
        std::fs::write(target, b"partial").map_err(ConversionError::Spawn)?;
        Err(ConversionError::Failed {
          code: Some(1),
          message: "export aborted".into(),
        })
      }
    }
    let dir = tempfile::tempdir().unwrap();
    let legacy = dir.path().join("m.pt");
    let target = dir.path().join("m.onnx");
    let cache = ConversionCache::new(Arc::new(PartialConverter));

    assert!(cache.get_or_convert(&legacy, &target, 640).is_err());
    assert!(!target.exists());
    assert_eq!(cache.state(&legacy), Some(ConversionState::Failed));
  }

  #[test]
  fn unknown_path_has_no_state() {
    let cache = ConversionCache::new(Arc::new(WritingConverter {
      calls: AtomicUsize::new(0),
      fail: false,
    }));
    assert_eq!(cache.state(Path::new("/m/never.pt")), None);
  }

  #[test]
  fn missing_output_is_an_error() {
    struct SilentConverter;
    impl ModelConverter for SilentConverter {
      fn convert(&self, _: &Path, _: &Path, _: u32) -> Result<(), ConversionError> {
        Ok(())
      }
    }
    let dir = tempfile::tempdir().unwrap();
    let cache = ConversionCache::new(Arc::new(SilentConverter));
    assert!(matches!(
      cache.get_or_convert(&dir.path().join("m.pt"), &dir.path().join("m.onnx"), 640),
      Err(ConversionError::MissingOutput(_))
    ));
  }

  #[test]
  fn stderr_tail_skips_blank_lines() {
    assert_eq!(tail_lines("a\n\nb\nc\n  \nd", 2), "c\nd");
  }
}
