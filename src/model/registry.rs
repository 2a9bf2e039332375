// 该文件是 Orbital Eye （轨道之眼） 项目的一部分。
// src/model/registry.rs - 模型注册表
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Orbital Eye contributors

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use tracing::{debug, error, info};

use super::{
  DEFAULT_MODEL_KEY, Device, DeviceMemory, DetectorHandle, ModelEntry, ModelLoadError,
  ModelLoader, ModelSource, PRETRAINED_MODEL, route,
};

type Slot = Arc<Mutex<Option<DetectorHandle>>>;

/// 目标类别到已加载模型的唯一映射。
///
/// 命中缓存只走 `loaded` 的读锁；未命中时先在 `slots` 上短暂加锁取得
/// 该键的槽位，再持有槽位锁完成加载，同一键的并发请求只会加载一次，
/// 其他键不受影响。
pub struct ModelRegistry {
  loader: Arc<dyn ModelLoader>,
  device: Device,
  model_dir: PathBuf,
  loaded: RwLock<HashMap<String, DetectorHandle>>,
  slots: Mutex<HashMap<String, Slot>>,
}

impl ModelRegistry {
  pub fn new(loader: Arc<dyn ModelLoader>, device: Device, model_dir: impl Into<PathBuf>) -> Self {
    let model_dir = model_dir.into();
    info!(
      "模型注册表初始化: 设备={}, 模型目录={}, 后端={}",
      device,
      model_dir.display(),
      loader.family()
    );
    Self {
      loader,
      device,
      model_dir,
      loaded: RwLock::new(HashMap::new()),
      slots: Mutex::new(HashMap::new()),
    }
  }

  pub fn device(&self) -> Device {
    self.device
  }

  pub fn family(&self) -> &str {
    self.loader.family()
  }

  pub fn device_memory(&self) -> Option<DeviceMemory> {
    self.loader.device_memory(self.device)
  }

  /// 未知类别回落到默认键
  pub fn resolve_key<'a>(&self, target_class: &'a str) -> &'a str {
    if route(target_class).is_some() {
      target_class
    } else {
      DEFAULT_MODEL_KEY
    }
  }

  pub fn resolve_source(&self, key: &str) -> Option<ModelSource> {
    let file = route(key)?;
    let fine_tuned = self.model_dir.join(file);
    if fine_tuned.is_file() {
      Some(ModelSource::FineTuned(fine_tuned))
    } else {
      Some(ModelSource::Pretrained(PRETRAINED_MODEL))
    }
  }

  pub fn get(&self, target_class: &str) -> Result<DetectorHandle, ModelLoadError> {
    let key = self.resolve_key(target_class);

    if let Some(handle) = self.cached(key) {
      return Ok(handle);
    }

    let slot = {
      let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
      slots.entry(key.to_string()).or_default().clone()
    };

    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = guard.as_ref() {
      debug!("模型已由并发请求加载: {}", key);
      return Ok(handle.clone());
    }

    let handle = self.load(key)?;
    *guard = Some(handle.clone());
    self
      .loaded
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(key.to_string(), handle.clone());
    Ok(handle)
  }

  /// 已缓存的类别键，按字典序
  pub fn loaded_keys(&self) -> Vec<String> {
    let loaded = self.loaded.read().unwrap_or_else(PoisonError::into_inner);
    let mut keys: Vec<String> = loaded.keys().cloned().collect();
    keys.sort();
    keys
  }

  fn cached(&self, key: &str) -> Option<DetectorHandle> {
    self
      .loaded
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(key)
      .cloned()
  }

  fn load(&self, key: &str) -> Result<DetectorHandle, ModelLoadError> {
    let source = self.resolve_source(key).ok_or_else(|| ModelLoadError {
      key: key.to_string(),
      source: anyhow::anyhow!("路由表中没有该类别"),
    })?;

    info!("加载模型: {} <- {} ({})", key, source, self.device);
    let now = Instant::now();
    let loaded = self.loader.load(&source, self.device).map_err(|e| {
      error!("模型加载失败: {} <- {}, 错误: {:#}", key, source, e);
      ModelLoadError {
        key: key.to_string(),
        source: e,
      }
    })?;
    info!(
      "模型加载完成: {}, 类别数: {}, 耗时: {:.2?}",
      key,
      loaded.class_names.len(),
      now.elapsed()
    );

    Ok(Arc::new(ModelEntry {
      key: key.to_string(),
      source,
      device: self.device,
      detector: loaded.detector,
      class_names: loaded.class_names,
    }))
  }
}
