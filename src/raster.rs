// 该文件是 Orbital Eye （轨道之眼） 项目的一部分。
// src/raster.rs - 栅格图像输入
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

use image::{ImageReader, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum ImageLoadError {
  #[error("未提供图像来源（path 与 data 均为空）")]
  Missing,
  #[error("图像来源不唯一：path 与 data 只能提供其一")]
  Ambiguous,
  #[error("读取图像失败 {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
  #[error("解码图像失败 {source_desc}: {source}")]
  Decode {
    source_desc: String,
    #[source]
    source: image::ImageError,
  },
}

/// 边界上的图像引用，path 与 data 恰好提供一个
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageRef {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<String>,
  /// JSON 中以 base64 字符串传输
  #[serde(
    default,
    with = "base64_bytes::option",
    skip_serializing_if = "Option::is_none"
  )]
  pub data: Option<Vec<u8>>,
}

impl ImageRef {
  pub fn from_path(path: impl Into<String>) -> Self {
    Self {
      path: Some(path.into()),
      data: None,
    }
  }

  pub fn from_bytes(data: Vec<u8>) -> Self {
    Self {
      path: None,
      data: Some(data),
    }
  }
}

#[derive(Debug, Clone)]
pub enum ImageSource {
  Path(PathBuf),
  Bytes(Vec<u8>),
}

impl fmt::Display for ImageSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ImageSource::Path(path) => write!(f, "{}", path.display()),
      ImageSource::Bytes(data) => write!(f, "<{} bytes>", data.len()),
    }
  }
}

impl TryFrom<ImageRef> for ImageSource {
  type Error = ImageLoadError;

  fn try_from(value: ImageRef) -> Result<Self, Self::Error> {
    let path = value.path.filter(|p| !p.is_empty());
    let data = value.data.filter(|d| !d.is_empty());
    match (path, data) {
      (Some(path), None) => Ok(ImageSource::Path(PathBuf::from(path))),
      (None, Some(data)) => Ok(ImageSource::Bytes(data)),
      (Some(_), Some(_)) => Err(ImageLoadError::Ambiguous),
      (None, None) => Err(ImageLoadError::Missing),
    }
  }
}

/// 解码后的 RGB8 栅格，HWC 排列
#[derive(Debug, Clone)]
pub struct Raster {
  image: RgbImage,
}

impl From<RgbImage> for Raster {
  fn from(image: RgbImage) -> Self {
    Self { image }
  }
}

impl Raster {
  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn is_empty(&self) -> bool {
    self.image.width() == 0 || self.image.height() == 0
  }

  pub fn as_rgb_image(&self) -> &RgbImage {
    &self.image
  }
}

pub fn decode(source: &ImageSource) -> Result<Raster, ImageLoadError> {
  let decoded = match source {
    ImageSource::Path(path) => {
      let reader = ImageReader::open(path).map_err(|e| {
        error!("打开图像文件失败: {}, 错误: {}", path.display(), e);
        ImageLoadError::Io {
          path: path.display().to_string(),
          source: e,
        }
      })?;
      let reader = reader.with_guessed_format().map_err(|e| ImageLoadError::Io {
        path: path.display().to_string(),
        source: e,
      })?;
      reader.decode()
    }
    ImageSource::Bytes(data) => image::load_from_memory(data),
  };

  let image = decoded.map_err(|e| {
    error!("图像解码失败: {}, 错误: {}", source, e);
    ImageLoadError::Decode {
      source_desc: source.to_string(),
      source: e,
    }
  })?;

  let raster = Raster::from(image.to_rgb8());
  debug!("图像解码完成: {} ({}x{})", source, raster.width(), raster.height());
  Ok(raster)
}

/// 从边界引用直接解码
pub fn decode_ref(image: ImageRef) -> Result<Raster, ImageLoadError> {
  let source = ImageSource::try_from(image)?;
  decode(&source)
}

pub mod base64_bytes;
