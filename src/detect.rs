// 该文件是 Orbital Eye （轨道之眼） 项目的一部分。
// src/detect.rs - 目标检测流程
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

use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::geo::{GeoPoint, pixel_to_geo};
use crate::model::{DEFAULT_MODEL_KEY, ModelLoadError, ModelRegistry, RawDetection};
use crate::raster::{ImageLoadError, Raster};

pub const DEFAULT_CONFIDENCE: f32 = 0.25;

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("图像错误: {0}")]
  Image(#[from] ImageLoadError),
  #[error(transparent)]
  ModelLoad(#[from] ModelLoadError),
  #[error("推理失败 [{key}]: {source:#}")]
  Inference {
    key: String,
    #[source]
    source: anyhow::Error,
  },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub class_name: String,
  pub confidence: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub estimated_length_m: Option<f32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub estimated_width_m: Option<f32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub geo_center: Option<GeoPoint>,
}

#[derive(Debug, Clone, Default)]
pub struct DetectParams {
  pub target_classes: Vec<String>,
  pub confidence_threshold: f32,
  pub gsd_meters: f32,
  pub top_left: Option<GeoPoint>,
}

impl DetectParams {
  pub fn model_key(&self) -> &str {
    self
      .target_classes
      .first()
      .map(String::as_str)
      .unwrap_or(DEFAULT_MODEL_KEY)
  }

  pub fn confidence(&self) -> f32 {
    if self.confidence_threshold > 0.0 {
      self.confidence_threshold
    } else {
      DEFAULT_CONFIDENCE
    }
  }
}

#[derive(Debug, Clone)]
pub struct DetectOutcome {
  pub detections: Vec<Detection>,
  pub elapsed_ms: f64,
  pub model_version: String,
}

/// 把后端输出的框整理为带类别名、尺寸和地理中心的检测结果
pub fn normalize(
  raw: RawDetection,
  class_name: String,
  width: u32,
  height: u32,
  gsd_meters: f32,
  top_left: Option<GeoPoint>,
) -> Detection {
  let (w, h) = (width as f32, height as f32);
  let [x0, y0, x1, y1] = raw.bbox;
  let x_min = x0.min(x1).clamp(0.0, w);
  let x_max = x0.max(x1).clamp(0.0, w);
  let y_min = y0.min(y1).clamp(0.0, h);
  let y_max = y0.max(y1).clamp(0.0, h);

  let (estimated_length_m, estimated_width_m) = if gsd_meters > 0.0 {
    (
      Some((x_max - x_min) * gsd_meters),
      Some((y_max - y_min) * gsd_meters),
    )
  } else {
    (None, None)
  };

  let geo_center = top_left.map(|top_left| {
    let cx = (x_min + x_max) as f64 / 2.0;
    let cy = (y_min + y_max) as f64 / 2.0;
    pixel_to_geo(cx, cy, gsd_meters as f64, top_left)
  });

  Detection {
    class_name,
    confidence: raw.confidence,
    bbox: [x_min, y_min, x_max, y_max],
    estimated_length_m,
    estimated_width_m,
    geo_center,
  }
}

pub fn detect(
  registry: &ModelRegistry,
  raster: &Raster,
  params: &DetectParams,
) -> Result<DetectOutcome, DetectError> {
  let now = Instant::now();
  let handle = registry.get(params.model_key())?;
  let confidence = params.confidence();

  debug!(
    "执行检测: 模型={}, 阈值={}, 图像={}x{}",
    handle.key,
    confidence,
    raster.width(),
    raster.height()
  );
  let raw = handle.detector.predict(raster, confidence).map_err(|e| {
    error!("推理失败: {}, 错误: {:#}", handle.key, e);
    DetectError::Inference {
      key: handle.key.clone(),
      source: e,
    }
  })?;

  let detections: Vec<Detection> = raw
    .into_iter()
    .map(|item| {
      let class_name = handle.class_name(item.class_id);
      normalize(
        item,
        class_name,
        raster.width(),
        raster.height(),
        params.gsd_meters,
        params.top_left,
      )
    })
    .collect();

  let elapsed_ms = now.elapsed().as_secs_f64() * 1000.0;
  info!(
    "检测完成: 模型={}, 目标数={}, 耗时: {:.2}ms",
    handle.key,
    detections.len(),
    elapsed_ms
  );

  Ok(DetectOutcome {
    detections,
    elapsed_ms,
    model_version: format!("{}-{}", registry.family(), handle.key),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Detector, Device, LoadedModel, ModelLoader, ModelSource};
  use image::RgbImage;
  use std::sync::Arc;

  struct Fixed(Vec<RawDetection>);

  impl Detector for Fixed {
    fn predict(&self, _: &Raster, confidence: f32) -> anyhow::Result<Vec<RawDetection>> {
      Ok(self.0.iter().filter(|d| d.confidence >= confidence).cloned().collect())
    }
  }

  struct FixedLoader;

  impl ModelLoader for FixedLoader {
    fn family(&self) -> &str {
      "fixed"
    }

    fn load(&self, _: &ModelSource, _: Device) -> anyhow::Result<LoadedModel> {
      Ok(LoadedModel {
        detector: Box::new(Fixed(vec![
          RawDetection {
            class_id: 1,
            confidence: 0.2,
            bbox: [10.0, 10.0, 20.0, 30.0],
          },
          RawDetection {
            class_id: 0,
            confidence: 0.9,
            bbox: [-5.0, 90.0, 50.0, 140.0],
          },
          RawDetection {
            class_id: 7,
            confidence: 0.5,
            bbox: [40.0, 40.0, 30.0, 30.0],
          },
        ])),
        class_names: vec!["ship".into(), "boat".into()],
      })
    }
  }

  fn setup() -> (ModelRegistry, Raster, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::new(Arc::new(FixedLoader), Device::Cpu, dir.path());
    (registry, Raster::from(RgbImage::new(100, 120)), dir)
  }

  #[test]
  fn default_threshold_and_key() {
    let params = DetectParams::default();
    assert_eq!(params.model_key(), "general");
    assert_eq!(params.confidence(), DEFAULT_CONFIDENCE);
  }

  #[test]
  fn boxes_stay_inside_raster() {
    let (registry, raster, _dir) = setup();
    let params = DetectParams {
      confidence_threshold: 0.1,
      ..Default::default()
    };
    let outcome = detect(&registry, &raster, &params).unwrap();
    assert_eq!(outcome.detections.len(), 3);
    for d in &outcome.detections {
      let [x0, y0, x1, y1] = d.bbox;
      assert!(0.0 <= x0 && x0 <= x1 && x1 <= 100.0);
      assert!(0.0 <= y0 && y0 <= y1 && y1 <= 120.0);
    }
    // 保持模型输出顺序
    let names: Vec<&str> = outcome.detections.iter().map(|d| d.class_name.as_str()).collect();
    assert_eq!(names, vec!["boat", "ship", "class_7"]);
  }

  #[test]
  fn default_threshold_filters_low_scores() {
    let (registry, raster, _dir) = setup();
    let outcome = detect(&registry, &raster, &DetectParams::default()).unwrap();
    assert_eq!(outcome.detections.len(), 2);
    assert_eq!(outcome.model_version, "fixed-general");
  }

  #[test]
  fn gsd_sets_size_and_geo_needs_reference() {
    let (registry, raster, _dir) = setup();
    let params = DetectParams {
      target_classes: vec!["vessels".into()],
      confidence_threshold: 0.8,
      gsd_meters: 2.0,
      top_left: None,
    };
    let outcome = detect(&registry, &raster, &params).unwrap();
    assert_eq!(outcome.model_version, "fixed-vessels");
    let d = &outcome.detections[0];
    assert_eq!(d.bbox, [0.0, 90.0, 50.0, 120.0]);
    assert_eq!(d.estimated_length_m, Some(100.0));
    assert_eq!(d.estimated_width_m, Some(60.0));
    assert_eq!(d.geo_center, None);
  }

  #[test]
  fn reference_point_at_origin_is_honoured() {
    let raw = RawDetection {
      class_id: 0,
      confidence: 0.9,
      bbox: [0.0, 0.0, 2.0, 0.0],
    };
    let d = normalize(raw, "ship".into(), 10, 10, 111.32, Some(GeoPoint::new(0.0, 0.0)));
    let center = d.geo_center.unwrap();
    assert!((center.longitude - 0.001).abs() < 1e-9);
    assert!(center.latitude.abs() < 1e-9);
  }

  #[test]
  fn zero_gsd_leaves_size_empty() {
    let raw = RawDetection {
      class_id: 0,
      confidence: 0.9,
      bbox: [1.0, 1.0, 5.0, 5.0],
    };
    let d = normalize(raw, "ship".into(), 10, 10, 0.0, None);
    assert_eq!(d.estimated_length_m, None);
    assert_eq!(d.estimated_width_m, None);
  }
}
