// 该文件是 Orbital Eye （轨道之眼） 项目的一部分。
// src/service.rs - 推理服务门面
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
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::change::{ChangeError, ChangeRegion, analyze_change};
use crate::detect::{DetectError, DetectParams, Detection, detect};
use crate::geo::GeoPoint;
use crate::model::ModelRegistry;
use crate::raster::{ImageRef, decode_ref};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
  InvalidArgument,
  Unimplemented,
  Internal,
}

/// 边界层的错误表示
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
  pub code: Code,
  pub message: String,
}

impl Status {
  pub fn invalid_argument(message: impl Into<String>) -> Self {
    Self {
      code: Code::InvalidArgument,
      message: message.into(),
    }
  }

  pub fn unimplemented(message: impl Into<String>) -> Self {
    Self {
      code: Code::Unimplemented,
      message: message.into(),
    }
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self {
      code: Code::Internal,
      message: message.into(),
    }
  }
}

impl fmt::Display for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}: {}", self.code, self.message)
  }
}

impl std::error::Error for Status {}

impl From<DetectError> for Status {
  fn from(err: DetectError) -> Self {
    match err {
      DetectError::Inference { .. } => Status::internal(err.to_string()),
      DetectError::Image(_) | DetectError::ModelLoad(_) => Status::invalid_argument(err.to_string()),
    }
  }
}

impl From<ChangeError> for Status {
  fn from(err: ChangeError) -> Self {
    match err {
      ChangeError::Encode(_) => Status::internal(err.to_string()),
      ChangeError::Image { .. } | ChangeError::EmptyRaster => {
        Status::invalid_argument(err.to_string())
      }
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectRequest {
  pub image: ImageRef,
  #[serde(default)]
  pub target_classes: Vec<String>,
  #[serde(default)]
  pub confidence_threshold: f32,
  #[serde(default)]
  pub gsd_meters: f32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub top_left: Option<GeoPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectResponse {
  pub detections: Vec<Detection>,
  pub inference_time_ms: f64,
  pub model_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeRequest {
  pub before: ImageRef,
  pub after: ImageRef,
  #[serde(default)]
  pub sensitivity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeResponse {
  #[serde(with = "crate::raster::base64_bytes")]
  pub change_mask: Vec<u8>,
  pub mask_width: u32,
  pub mask_height: u32,
  pub regions: Vec<ChangeRegion>,
  pub change_percentage: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnhanceRequest {
  pub image: ImageRef,
  #[serde(default)]
  pub scale_factor: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhanceResponse {
  #[serde(with = "crate::raster::base64_bytes")]
  pub enhanced: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
  pub ready: bool,
  pub device: String,
  pub loaded_models: Vec<String>,
  pub device_memory_used_mb: u64,
  pub device_memory_total_mb: u64,
}

/// 把请求路由到检测或变化分析流程，并把错误转换为 `Status`
#[derive(Clone)]
pub struct DetectorService {
  registry: Arc<ModelRegistry>,
}

impl DetectorService {
  pub fn new(registry: Arc<ModelRegistry>) -> Self {
    Self { registry }
  }

  pub fn detect(&self, request: DetectRequest) -> Result<DetectResponse, Status> {
    info!(
      "DetectObjects: targets={:?}, gsd={}m",
      request.target_classes, request.gsd_meters
    );
    let raster = decode_ref(request.image).map_err(|e| {
      warn!("检测请求图像无效: {}", e);
      Status::from(DetectError::from(e))
    })?;

    let params = DetectParams {
      target_classes: request.target_classes,
      confidence_threshold: request.confidence_threshold,
      gsd_meters: request.gsd_meters,
      top_left: request.top_left,
    };
    let outcome = detect(&self.registry, &raster, &params).map_err(|e| {
      warn!("检测失败: {}", e);
      Status::from(e)
    })?;

    Ok(DetectResponse {
      detections: outcome.detections,
      inference_time_ms: outcome.elapsed_ms,
      model_version: outcome.model_version,
    })
  }

  pub fn detect_changes(&self, request: ChangeRequest) -> Result<ChangeResponse, Status> {
    info!("DetectChanges: sensitivity={}", request.sensitivity);
    let before = decode_ref(request.before).map_err(|source| ChangeError::Image {
      which: "before",
      source,
    });
    let after = decode_ref(request.after).map_err(|source| ChangeError::Image {
      which: "after",
      source,
    });

    let result = before
      .and_then(|before| after.and_then(|after| analyze_change(&before, &after, request.sensitivity)))
      .map_err(|e| {
        warn!("变化检测失败: {}", e);
        Status::from(e)
      })?;

    Ok(ChangeResponse {
      change_mask: result.mask_png,
      mask_width: result.mask_width,
      mask_height: result.mask_height,
      regions: result.regions,
      change_percentage: result.change_percentage,
    })
  }

  pub fn enhance(&self, request: EnhanceRequest) -> Result<EnhanceResponse, Status> {
    info!("Enhance: scale={}x", request.scale_factor);
    Err(Status::unimplemented("超分辨率增强尚未实现"))
  }

  pub fn health(&self) -> HealthReport {
    let memory = self.registry.device_memory().unwrap_or_default();
    HealthReport {
      ready: true,
      device: self.registry.device().to_string(),
      loaded_models: self.registry.loaded_keys(),
      device_memory_used_mb: memory.used_mb,
      device_memory_total_mb: memory.total_mb,
    }
  }
}
