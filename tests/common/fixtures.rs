use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use image::{ImageBuffer, Rgb, RgbImage};
use orbital_eye::model::{
  Detector, Device, LoadedModel, ModelLoader, ModelRegistry, ModelSource, RawDetection,
};
use orbital_eye::raster::Raster;
use orbital_eye::server;
use orbital_eye::service::DetectorService;
use orbital_eye::worker::WorkerPool;
use tempfile::{NamedTempFile, TempDir};

/// 黑色背景上放置一个白色方块
pub fn square_scene(size: u32, square: Option<(u32, u32, u32)>) -> RgbImage {
  ImageBuffer::from_fn(size, size, |x, y| match square {
    Some((x0, y0, side)) if x >= x0 && x < x0 + side && y >= y0 && y < y0 + side => {
      Rgb([255u8, 255, 255])
    }
    _ => Rgb([0u8, 0, 0]),
  })
}

/// 保存为临时 PNG 文件，文件随返回值一起释放
pub fn save_png(img: &RgbImage) -> NamedTempFile {
  let file = tempfile::Builder::new()
    .suffix(".png")
    .tempfile()
    .expect("Failed to create temp image file");
  img
    .save_with_format(file.path(), image::ImageFormat::Png)
    .expect("Failed to save test image");
  file
}

pub fn png_bytes(img: &RgbImage) -> Vec<u8> {
  let mut buf = std::io::Cursor::new(Vec::new());
  img
    .write_to(&mut buf, image::ImageFormat::Png)
    .expect("Failed to encode test image");
  buf.into_inner()
}

/// 传输层中字节字段的 base64 形式
pub fn png_base64(img: &RgbImage) -> String {
  use base64::Engine;
  base64::engine::general_purpose::STANDARD.encode(png_bytes(img))
}

/// 固定输出一只“船”，不依赖真实权重
pub struct OneShip;

impl Detector for OneShip {
  fn predict(&self, _raster: &Raster, confidence: f32) -> anyhow::Result<Vec<RawDetection>> {
    let detection = RawDetection {
      class_id: 0,
      confidence: 0.8,
      bbox: [10.0, 20.0, 30.0, 25.0],
    };
    Ok(
      std::iter::once(detection)
        .filter(|d| d.confidence >= confidence)
        .collect(),
    )
  }
}

pub struct ShipLoader;

impl ModelLoader for ShipLoader {
  fn family(&self) -> &str {
    "test"
  }

  fn load(&self, _source: &ModelSource, _device: Device) -> anyhow::Result<LoadedModel> {
    Ok(LoadedModel {
      detector: Box::new(OneShip),
      class_names: vec!["ship".into()],
    })
  }
}

/// 返回服务和模型目录（目录需保持存活）
pub fn ship_service() -> (DetectorService, TempDir) {
  let dir = TempDir::new().expect("Failed to create temp directory");
  let registry = ModelRegistry::new(Arc::new(ShipLoader), Device::Cpu, dir.path());
  (DetectorService::new(Arc::new(registry)), dir)
}

/// 在随机端口上运行的服务，释放时停止
pub struct RunningServer {
  pub addr: SocketAddr,
  stop: Option<Sender<()>>,
  handle: Option<JoinHandle<()>>,
  _model_dir: TempDir,
}

impl RunningServer {
  pub fn start() -> Self {
    let (service, model_dir) = ship_service();
    let pool = Arc::new(WorkerPool::new(2).expect("Failed to start worker pool"));
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to read local addr");
    let (stop, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
      server::serve(listener, service, pool, rx).expect("server failed");
    });
    Self {
      addr,
      stop: Some(stop),
      handle: Some(handle),
      _model_dir: model_dir,
    }
  }

  pub fn connect(&self) -> Client {
    let stream = TcpStream::connect(self.addr).expect("Failed to connect");
    Client {
      reader: BufReader::new(stream.try_clone().expect("Failed to clone stream")),
      writer: stream,
    }
  }
}

impl Drop for RunningServer {
  fn drop(&mut self) {
    if let Some(stop) = self.stop.take() {
      let _ = stop.send(());
    }
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

pub struct Client {
  reader: BufReader<TcpStream>,
  writer: TcpStream,
}

impl Client {
  pub fn call(&mut self, request: &serde_json::Value) -> serde_json::Value {
    let mut line = serde_json::to_vec(request).expect("Failed to encode request");
    line.push(b'\n');
    self.call_raw(&line)
  }

  pub fn call_raw(&mut self, line: &[u8]) -> serde_json::Value {
    self.writer.write_all(line).expect("Failed to send request");
    let mut reply = String::new();
    self.reader.read_line(&mut reply).expect("Failed to read reply");
    serde_json::from_str(&reply).expect("Reply is not JSON")
  }
}
