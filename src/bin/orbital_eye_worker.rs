// 该文件是 Orbital Eye （轨道之眼） 项目的一部分。
// src/bin/orbital_eye_worker.rs - AI 推理服务入口
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

use std::net::{IpAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use orbital_eye::{
  config::{self, ServiceConfig},
  model::{DevicePreference, ModelLoader, ModelRegistry},
  server,
  service::DetectorService,
  worker::WorkerPool,
};

/// Orbital Eye AI Worker 参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 监听端口
  #[arg(long, default_value_t = config::DEFAULT_PORT, value_name = "PORT")]
  pub port: u16,

  /// 模型目录，存放微调后的 ONNX 权重
  #[arg(long, default_value = config::DEFAULT_MODEL_DIR, value_name = "DIR")]
  pub model_dir: PathBuf,

  /// 推理设备
  #[arg(long, value_enum, default_value_t = DevicePreference::Auto)]
  pub device: DevicePreference,

  /// 工作线程数
  #[arg(long, default_value_t = config::DEFAULT_WORKERS, value_name = "COUNT")]
  pub workers: usize,

  /// 监听地址
  #[arg(long, default_value = "0.0.0.0", value_name = "HOST")]
  pub host: IpAddr,
}

impl From<Args> for ServiceConfig {
  fn from(args: Args) -> Self {
    ServiceConfig {
      host: args.host,
      port: args.port,
      model_dir: args.model_dir,
      device: args.device,
      workers: args.workers,
    }
  }
}

#[cfg(feature = "backend-tract")]
fn loader(config: &ServiceConfig) -> Arc<dyn ModelLoader> {
  Arc::new(orbital_eye::model::YoloOnnxLoader::new(&config.model_dir))
}

#[cfg(not(feature = "backend-tract"))]
fn loader(_config: &ServiceConfig) -> Arc<dyn ModelLoader> {
  tracing::warn!("未启用推理后端，目标检测请求将返回错误");
  Arc::new(orbital_eye::model::UnavailableLoader)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let config = ServiceConfig::from(Args::parse());
  config.ensure_model_dir()?;

  let loader = loader(&config);
  let device = config.resolve_device(loader.as_ref())?;
  info!("推理后端: {}", loader.family());
  info!("推理设备: {}", device);
  info!("模型目录: {}", config.model_dir.display());

  let registry = Arc::new(ModelRegistry::new(loader, device, &config.model_dir));
  let service = DetectorService::new(registry);
  let pool = Arc::new(WorkerPool::new(config.workers).context("无法启动工作线程池")?);

  let stop = server::install_shutdown_handler().context("无法设置 Ctrl-C 处理程序")?;
  let listener = TcpListener::bind(config.listen_addr())
    .with_context(|| format!("无法监听 {}", config.listen_addr()))?;

  server::serve(listener, service, pool, stop)?;
  info!("AI Worker 已退出");
  Ok(())
}
