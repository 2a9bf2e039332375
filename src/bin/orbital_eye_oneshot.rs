// 该文件是 Orbital Eye （轨道之眼） 项目的一部分。
// src/bin/orbital_eye_oneshot.rs - 本地单次检测/变化分析
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

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use orbital_eye::{
  change::DEFAULT_SENSITIVITY,
  config::{self, ServiceConfig},
  geo::{GeoPoint, bbox_from_center, haversine_km},
  model::{DevicePreference, ModelLoader, ModelRegistry},
  raster::ImageRef,
  service::{ChangeRequest, DetectRequest, DetectorService},
};

/// 不启动服务，直接在本地运行一次推理并输出 JSON
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型目录
  #[arg(long, default_value = config::DEFAULT_MODEL_DIR, value_name = "DIR")]
  pub model_dir: PathBuf,

  /// 推理设备
  #[arg(long, value_enum, default_value_t = DevicePreference::Auto)]
  pub device: DevicePreference,

  /// 输出格式化后的 JSON
  #[arg(long)]
  pub pretty: bool,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 目标检测
  Detect {
    /// 输入图像
    #[arg(long, value_name = "IMAGE")]
    image: String,
    /// 目标类别，可重复
    #[arg(long = "target", value_name = "CLASS")]
    targets: Vec<String>,
    /// 置信度阈值，0 表示使用默认值
    #[arg(long, default_value = "0", value_name = "THRESHOLD")]
    confidence: f32,
    /// 地面采样距离（米/像素）
    #[arg(long, default_value = "0", value_name = "METERS")]
    gsd: f32,
    /// 图像左上角纬度
    #[arg(long, requires = "lon", allow_hyphen_values = true)]
    lat: Option<f64>,
    /// 图像左上角经度
    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    lon: Option<f64>,
  },
  /// 变化检测
  Changes {
    /// 变化前图像
    #[arg(long, value_name = "IMAGE")]
    before: String,
    /// 变化后图像
    #[arg(long, value_name = "IMAGE")]
    after: String,
    /// 灵敏度 (0.0 - 1.0)
    #[arg(long, default_value_t = DEFAULT_SENSITIVITY, value_name = "SENSITIVITY")]
    sensitivity: f32,
  },
  /// 以中心点和半径计算影像检索范围
  Area {
    /// 中心纬度
    #[arg(long, allow_hyphen_values = true)]
    lat: f64,
    /// 中心经度
    #[arg(long, allow_hyphen_values = true)]
    lon: f64,
    /// 半径（千米）
    #[arg(long, default_value = "10", value_name = "KM")]
    radius: f64,
  },
}

#[cfg(feature = "backend-tract")]
fn loader(model_dir: &std::path::Path) -> Arc<dyn ModelLoader> {
  Arc::new(orbital_eye::model::YoloOnnxLoader::new(model_dir))
}

#[cfg(not(feature = "backend-tract"))]
fn loader(_model_dir: &std::path::Path) -> Arc<dyn ModelLoader> {
  Arc::new(orbital_eye::model::UnavailableLoader)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let config = ServiceConfig {
    model_dir: args.model_dir,
    device: args.device,
    ..Default::default()
  };

  let loader = loader(&config.model_dir);
  let device = config.resolve_device(loader.as_ref())?;
  let registry = Arc::new(ModelRegistry::new(loader, device, &config.model_dir));
  let service = DetectorService::new(registry);

  let now = std::time::Instant::now();
  let output = match args.command {
    Command::Detect {
      image,
      targets,
      confidence,
      gsd,
      lat,
      lon,
    } => {
      let request = DetectRequest {
        image: ImageRef::from_path(image),
        target_classes: targets,
        confidence_threshold: confidence,
        gsd_meters: gsd,
        top_left: lat.zip(lon).map(|(lat, lon)| GeoPoint::new(lat, lon)),
      };
      let response = service.detect(request)?;
      info!("检测到 {} 个目标", response.detections.len());
      serde_json::to_value(response)?
    }
    Command::Changes {
      before,
      after,
      sensitivity,
    } => {
      let request = ChangeRequest {
        before: ImageRef::from_path(before),
        after: ImageRef::from_path(after),
        sensitivity,
      };
      let mut response = service.detect_changes(request)?;
      info!(
        "变化区域 {} 个，变化比例 {:.2}%",
        response.regions.len(),
        response.change_percentage
      );
      // 掩码以 PNG 字节存在，终端输出时省略
      response.change_mask.clear();
      serde_json::to_value(response)?
    }
    Command::Area { lat, lon, radius } => {
      let bbox = bbox_from_center(GeoPoint::new(lat, lon), radius);
      let diagonal_km = haversine_km(
        GeoPoint::new(bbox.south, bbox.west),
        GeoPoint::new(bbox.north, bbox.east),
      );
      info!("检索范围对角线: {:.2} km", diagonal_km);
      serde_json::json!({ "bbox": bbox, "diagonal_km": diagonal_km })
    }
  };
  info!("完成，耗时: {:.2?}", now.elapsed());

  if args.pretty {
    println!("{}", serde_json::to_string_pretty(&output)?);
  } else {
    println!("{}", output);
  }
  Ok(())
}
