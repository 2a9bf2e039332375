// 该文件是 Orbital Eye （轨道之眼） 项目的一部分。
// src/model/yolo_onnx.rs - 基于 tract 的 YOLO ONNX 检测器
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

use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use image::imageops::{FilterType, resize};
use tract_onnx::prelude::*;
use tracing::{debug, info, warn};

use crate::model::{Detector, Device, LoadedModel, ModelLoader, ModelSource, RawDetection};
use crate::raster::Raster;

const YOLO_INPUT_SIZE: u32 = 640;
const YOLO_NMS_IOU: f32 = 0.45;
const YOLO_FAMILY: &str = "yolov8";

type RunFn = Box<dyn Fn(Tensor) -> TractResult<TVec<TValue>> + Send + Sync>;

pub struct YoloOnnxDetector {
  run: RunFn,
  input_size: u32,
  iou_threshold: f32,
}

impl YoloOnnxDetector {
  pub fn open(model_path: &Path, input_size: u32) -> anyhow::Result<Self> {
    info!("加载 ONNX 模型文件: {}", model_path.display());
    let size = input_size as usize;
    let plan = tract_onnx::onnx()
      .model_for_path(model_path)
      .with_context(|| format!("无法读取 ONNX 模型 {}", model_path.display()))?
      .with_input_fact(
        0,
        InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
      )
      .context("无法设置模型输入形状")?
      .into_optimized()
      .context("模型优化失败")?
      .into_runnable()
      .context("无法构建可执行模型")?;

    Ok(Self {
      run: Box::new(move |input: Tensor| plan.run(tvec!(input.into()))),
      input_size,
      iou_threshold: YOLO_NMS_IOU,
    })
  }

  fn build_input(&self, raster: &Raster) -> Tensor {
    let size = self.input_size;
    let resized = resize(raster.as_rgb_image(), size, size, FilterType::Triangle);
    let size = size as usize;
    tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
      resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
    .into_tensor()
  }
}

impl Detector for YoloOnnxDetector {
  fn predict(&self, raster: &Raster, confidence: f32) -> anyhow::Result<Vec<RawDetection>> {
    let input = self.build_input(raster);
    let outputs = (self.run)(input).context("ONNX 推理失败")?;
    let output = outputs.first().ok_or_else(|| anyhow!("模型没有输出"))?;
    let view = output
      .to_array_view::<f32>()
      .context("模型输出不是 f32 张量")?
      .into_dimensionality::<tract_ndarray::Ix3>()
      .context("模型输出维度不是 [1, C, N]")?;

    // [1, 4 + nc, N]；部分导出为 [1, N, 4 + nc]
    let (_, d1, d2) = view.dim();
    let transposed = d1 > d2;
    let (channels, anchors) = if transposed { (d2, d1) } else { (d1, d2) };
    if channels <= 4 {
      return Err(anyhow!("模型输出通道数过少: {}", channels));
    }
    let value = |c: usize, i: usize| {
      if transposed {
        view[[0, i, c]]
      } else {
        view[[0, c, i]]
      }
    };

    let sx = raster.width() as f32 / self.input_size as f32;
    let sy = raster.height() as f32 / self.input_size as f32;
    let (w, h) = (raster.width() as f32, raster.height() as f32);

    let mut candidates = Vec::new();
    for i in 0..anchors {
      let (class_id, score) = (4..channels)
        .map(|c| (c - 4, value(c, i)))
        .fold((0usize, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
      if score < confidence {
        continue;
      }
      let (cx, cy, bw, bh) = (value(0, i), value(1, i), value(2, i), value(3, i));
      candidates.push(RawDetection {
        class_id: class_id as u32,
        confidence: score,
        bbox: [
          ((cx - bw / 2.0) * sx).clamp(0.0, w),
          ((cy - bh / 2.0) * sy).clamp(0.0, h),
          ((cx + bw / 2.0) * sx).clamp(0.0, w),
          ((cy + bh / 2.0) * sy).clamp(0.0, h),
        ],
      });
    }

    debug!("候选框 {} 个，执行 NMS", candidates.len());
    Ok(non_max_suppression(candidates, self.iou_threshold))
  }
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
  let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
  let inter = ix * iy;
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - inter;
  if union <= 0.0 { 0.0 } else { inter / union }
}

/// 按类别的贪心 NMS，结果按置信度降序
fn non_max_suppression(mut boxes: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
  boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
  let mut kept: Vec<RawDetection> = Vec::new();
  for candidate in boxes {
    let suppressed = kept
      .iter()
      .any(|k| k.class_id == candidate.class_id && iou(&k.bbox, &candidate.bbox) > iou_threshold);
    if !suppressed {
      kept.push(candidate);
    }
  }
  kept
}

fn read_labels(model_path: &Path) -> Vec<String> {
  let labels_path = model_path.with_extension("labels.json");
  match std::fs::read(&labels_path) {
    Ok(data) => match serde_json::from_slice::<Vec<String>>(&data) {
      Ok(labels) => labels,
      Err(e) => {
        warn!("类别表解析失败: {}, 错误: {}", labels_path.display(), e);
        Vec::new()
      }
    },
    Err(_) => {
      warn!("未找到类别表 {}，使用类别编号", labels_path.display());
      Vec::new()
    }
  }
}

/// 从 model_dir 加载 YOLO ONNX 权重，仅支持 CPU
pub struct YoloOnnxLoader {
  model_dir: PathBuf,
  input_size: u32,
}

impl YoloOnnxLoader {
  pub fn new(model_dir: impl Into<PathBuf>) -> Self {
    Self {
      model_dir: model_dir.into(),
      input_size: YOLO_INPUT_SIZE,
    }
  }

  fn weights_path(&self, source: &ModelSource) -> anyhow::Result<PathBuf> {
    match source {
      ModelSource::FineTuned(path) => Ok(path.clone()),
      ModelSource::Pretrained(id) => {
        let path = self.model_dir.join(id);
        if path.is_file() {
          Ok(path)
        } else {
          Err(anyhow!("未找到预训练权重 {}", path.display()))
        }
      }
    }
  }
}

impl ModelLoader for YoloOnnxLoader {
  fn family(&self) -> &str {
    YOLO_FAMILY
  }

  fn load(&self, source: &ModelSource, device: Device) -> anyhow::Result<LoadedModel> {
    if device != Device::Cpu {
      return Err(anyhow!("tract 后端仅支持 CPU，收到设备 {}", device));
    }
    let path = self.weights_path(source)?;
    let detector = YoloOnnxDetector::open(&path, self.input_size)?;
    Ok(LoadedModel {
      detector: Box::new(detector),
      class_names: read_labels(&path),
    })
  }
}
