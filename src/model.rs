// 该文件是 Orbital Eye （轨道之眼） 项目的一部分。
// src/model.rs - 模型与推理后端定义
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

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::raster::Raster;

pub const DEFAULT_MODEL_KEY: &str = "general";
pub const PRETRAINED_MODEL: &str = "yolov8n.onnx";

/// 目标类别 -> 模型文件名
pub const MODEL_ROUTES: [(&str, &str); 5] = [
  ("general", "general.onnx"),
  ("vessels", "vessels.onnx"),
  ("aircraft", "aircraft.onnx"),
  ("vehicles", "vehicles.onnx"),
  ("facilities", "facilities.onnx"),
];

pub fn route(key: &str) -> Option<&'static str> {
  MODEL_ROUTES
    .iter()
    .find(|(k, _)| *k == key)
    .map(|(_, file)| *file)
}

/// 启动时由配置给出的设备偏好
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DevicePreference {
  #[default]
  Auto,
  Cuda,
  Cpu,
}

/// 解析后的具体设备
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
  Cpu,
  Cuda(u32),
}

impl fmt::Display for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Device::Cpu => write!(f, "cpu"),
      Device::Cuda(index) => write!(f, "cuda:{}", index),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
  /// model_dir 下的微调权重
  FineTuned(PathBuf),
  /// 通用预训练模型标识
  Pretrained(&'static str),
}

impl fmt::Display for ModelSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ModelSource::FineTuned(path) => write!(f, "{}", path.display()),
      ModelSource::Pretrained(id) => write!(f, "pretrained:{}", id),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
  pub class_id: u32,
  pub confidence: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，栅格像素坐标
}

pub trait Detector: Send + Sync {
  fn predict(&self, raster: &Raster, confidence: f32) -> anyhow::Result<Vec<RawDetection>>;
}

pub struct LoadedModel {
  pub detector: Box<dyn Detector>,
  pub class_names: Vec<String>,
}

pub struct ModelEntry {
  pub key: String,
  pub source: ModelSource,
  pub device: Device,
  pub detector: Box<dyn Detector>,
  pub class_names: Vec<String>,
}

impl ModelEntry {
  pub fn class_name(&self, class_id: u32) -> String {
    self
      .class_names
      .get(class_id as usize)
      .cloned()
      .unwrap_or_else(|| format!("class_{}", class_id))
  }
}

impl fmt::Debug for ModelEntry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModelEntry")
      .field("key", &self.key)
      .field("source", &self.source)
      .field("device", &self.device)
      .field("classes", &self.class_names.len())
      .finish()
  }
}

pub type DetectorHandle = Arc<ModelEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceMemory {
  pub used_mb: u64,
  pub total_mb: u64,
}

/// 模型加载能力，由注册表注入
pub trait ModelLoader: Send + Sync {
  /// 模型族名称，用于版本标签
  fn family(&self) -> &str;

  fn load(&self, source: &ModelSource, device: Device) -> anyhow::Result<LoadedModel>;

  fn gpu_available(&self) -> bool {
    false
  }

  fn device_memory(&self, _device: Device) -> Option<DeviceMemory> {
    None
  }
}

#[derive(Error, Debug)]
#[error("模型加载失败 [{key}]: {source:#}")]
pub struct ModelLoadError {
  pub key: String,
  #[source]
  pub source: anyhow::Error,
}

/// 未编译任何推理后端时使用
pub struct UnavailableLoader;

impl ModelLoader for UnavailableLoader {
  fn family(&self) -> &str {
    "none"
  }

  fn load(&self, source: &ModelSource, _device: Device) -> anyhow::Result<LoadedModel> {
    anyhow::bail!("未启用推理后端，无法加载 {}（请启用 backend-tract 特性）", source)
  }
}

pub mod registry;
pub use self::registry::ModelRegistry;

#[cfg(feature = "backend-tract")]
mod yolo_onnx;
#[cfg(feature = "backend-tract")]
pub use self::yolo_onnx::{YoloOnnxDetector, YoloOnnxLoader};
