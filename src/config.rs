// 该文件是 Orbital Eye （轨道之眼） 项目的一部分。
// src/config.rs - 服务配置
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

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, warn};

use crate::model::{Device, DevicePreference, ModelLoader};
use crate::raster::base64_bytes::encoded_len;

pub const DEFAULT_PORT: u16 = 50051;
pub const DEFAULT_MODEL_DIR: &str = "models/";
pub const DEFAULT_WORKERS: usize = 4;
/// 单个请求/响应可携带的原始字节（图像、掩膜）上限
pub const MAX_PAYLOAD_BYTES: usize = 100 * 1024 * 1024;
/// JSON 字段名、检测结果等非负载内容的余量
const ENVELOPE_BYTES: usize = 1024 * 1024;
/// 单行消息的最大字节数，字节字段按 base64 计算
pub const MAX_MESSAGE_BYTES: usize = encoded_len(MAX_PAYLOAD_BYTES) + ENVELOPE_BYTES;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("无法创建模型目录 {path}: {source}")]
  ModelDir {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("请求使用 CUDA，但当前推理后端没有可用的 GPU")]
  GpuUnavailable,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
  pub host: IpAddr,
  pub port: u16,
  pub model_dir: PathBuf,
  pub device: DevicePreference,
  pub workers: usize,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
      port: DEFAULT_PORT,
      model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
      device: DevicePreference::Auto,
      workers: DEFAULT_WORKERS,
    }
  }
}

impl ServiceConfig {
  pub fn listen_addr(&self) -> SocketAddr {
    SocketAddr::new(self.host, self.port)
  }

  /// 模型目录不存在时创建
  pub fn ensure_model_dir(&self) -> Result<(), ConfigError> {
    if !self.model_dir.is_dir() {
      info!("创建模型目录: {}", self.model_dir.display());
    }
    std::fs::create_dir_all(&self.model_dir).map_err(|source| ConfigError::ModelDir {
      path: self.model_dir.clone(),
      source,
    })
  }

  /// 启动时把设备偏好解析为具体设备
  pub fn resolve_device(&self, loader: &dyn ModelLoader) -> Result<Device, ConfigError> {
    resolve_device(self.device, loader.gpu_available())
  }
}

pub fn resolve_device(preference: DevicePreference, gpu_available: bool) -> Result<Device, ConfigError> {
  match (preference, gpu_available) {
    (DevicePreference::Cpu, _) => Ok(Device::Cpu),
    (DevicePreference::Cuda, true) | (DevicePreference::Auto, true) => Ok(Device::Cuda(0)),
    (DevicePreference::Cuda, false) => Err(ConfigError::GpuUnavailable),
    (DevicePreference::Auto, false) => {
      warn!("未检测到 GPU，使用 CPU");
      Ok(Device::Cpu)
    }
  }
}
