// 该文件是 Orbital Eye （轨道之眼） 项目的一部分。
// src/change.rs - 变化检测流程
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

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::LazyLock;
use std::time::Instant;

use image::imageops::{FilterType, grayscale, resize};
use image::{GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use imageproc::morphology::{Mask, grayscale_close, grayscale_open};
use imageproc::region_labelling::{Connectivity, connected_components};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::raster::{ImageLoadError, Raster};

pub const DEFAULT_SENSITIVITY: f32 = 0.5;
pub const MIN_REGION_AREA: u32 = 100;
pub const FULL_SIGNIFICANCE_AREA: f32 = 10_000.0;
pub const DEFAULT_CHANGE_TYPE: &str = "activity_change";

pub const FOREGROUND: u8 = 255;
pub const BACKGROUND: u8 = 0;

/// 5x5 椭圆结构元素，共 17 个像素
const CLEANUP_ELLIPSE: [[u8; 5]; 5] = [
  [0, 0, 1, 0, 0],
  [1, 1, 1, 1, 1],
  [1, 1, 1, 1, 1],
  [1, 1, 1, 1, 1],
  [0, 0, 1, 0, 0],
];

static CLEANUP_MASK: LazyLock<Mask> = LazyLock::new(|| {
  let element = GrayImage::from_fn(5, 5, |x, y| {
    Luma([CLEANUP_ELLIPSE[y as usize][x as usize] * FOREGROUND])
  });
  Mask::from_image(&element, 2, 2)
});

#[derive(Error, Debug)]
pub enum ChangeError {
  #[error("{which} 图像错误: {source}")]
  Image {
    which: &'static str,
    #[source]
    source: ImageLoadError,
  },
  #[error("图像尺寸为空")]
  EmptyRaster,
  #[error("变化掩膜编码失败: {0}")]
  Encode(#[from] image::ImageError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRegion {
  pub bbox: [u32; 4], // [x_min, y_min, x_max, y_max]，max 为开区间
  pub change_type: String,
  pub significance: f32,
  pub area_px: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeResult {
  /// 单通道 PNG，255 为变化像素
  pub mask_png: Vec<u8>,
  pub mask_width: u32,
  pub mask_height: u32,
  pub regions: Vec<ChangeRegion>,
  pub change_percentage: f64,
}

fn effective_sensitivity(sensitivity: f32) -> f32 {
  if sensitivity > 0.0 {
    sensitivity.min(1.0)
  } else {
    DEFAULT_SENSITIVITY
  }
}

/// 尺寸不一致时把 after 缩放到 before 的尺寸（不做配准）
pub fn align<'a>(before: &Raster, after: &'a Raster) -> std::borrow::Cow<'a, RgbImage> {
  if before.width() == after.width() && before.height() == after.height() {
    std::borrow::Cow::Borrowed(after.as_rgb_image())
  } else {
    debug!(
      "对齐图像: {}x{} -> {}x{}",
      after.width(),
      after.height(),
      before.width(),
      before.height()
    );
    std::borrow::Cow::Owned(resize(
      after.as_rgb_image(),
      before.width(),
      before.height(),
      FilterType::Triangle,
    ))
  }
}

/// 逐通道绝对差，再转为灰度幅值
pub fn difference(before: &RgbImage, after: &RgbImage) -> GrayImage {
  let diff = RgbImage::from_fn(before.width(), before.height(), |x, y| {
    let a = before.get_pixel(x, y);
    let b = after.get_pixel(x, y);
    Rgb([
      a[0].abs_diff(b[0]),
      a[1].abs_diff(b[1]),
      a[2].abs_diff(b[2]),
    ])
  });
  grayscale(&diff)
}

/// 灰度差严格大于 255 * (1 - sensitivity) 的像素为前景
pub fn threshold(diff: &GrayImage, sensitivity: f32) -> GrayImage {
  let level = 255.0 * (1.0 - effective_sensitivity(sensitivity));
  GrayImage::from_fn(diff.width(), diff.height(), |x, y| {
    if diff.get_pixel(x, y)[0] as f32 > level {
      Luma([FOREGROUND])
    } else {
      Luma([BACKGROUND])
    }
  })
}

/// 先开后闭；越界邻域不参与计算，贴边的前景不会被腐蚀
pub fn clean(mask: &GrayImage) -> GrayImage {
  grayscale_close(&grayscale_open(mask, &CLEANUP_MASK), &CLEANUP_MASK)
}

/// 把被前景完全包围的背景空洞并入前景，只留下外轮廓所围的区域
pub fn fill_holes(mask: &GrayImage) -> GrayImage {
  let (width, height) = mask.dimensions();
  if width == 0 || height == 0 {
    return mask.clone();
  }
  // 8 连通前景对应 4 连通背景
  let background = connected_components(mask, Connectivity::Four, Luma([FOREGROUND]));

  let mut outside = HashSet::new();
  for x in 0..width {
    outside.insert(background.get_pixel(x, 0)[0]);
    outside.insert(background.get_pixel(x, height - 1)[0]);
  }
  for y in 0..height {
    outside.insert(background.get_pixel(0, y)[0]);
    outside.insert(background.get_pixel(width - 1, y)[0]);
  }

  GrayImage::from_fn(width, height, |x, y| {
    let label = background.get_pixel(x, y)[0];
    if label != 0 && outside.contains(&label) {
      Luma([BACKGROUND])
    } else {
      Luma([FOREGROUND])
    }
  })
}

#[derive(Debug, Clone, Copy)]
struct RegionStats {
  min_x: u32,
  min_y: u32,
  max_x: u32,
  max_y: u32,
  area: u32,
}

/// 外部 8 连通区域（含其内部空洞），过滤小于 MIN_REGION_AREA 的噪声，按 (y_min, x_min) 排序
pub fn extract_regions(mask: &GrayImage) -> Vec<ChangeRegion> {
  let labels = connected_components(&fill_holes(mask), Connectivity::Eight, Luma([BACKGROUND]));

  let mut stats: Vec<Option<RegionStats>> = Vec::new();
  for (x, y, label) in labels.enumerate_pixels() {
    let label = label[0] as usize;
    if label == 0 {
      continue;
    }
    if stats.len() < label {
      stats.resize(label, None);
    }
    let entry = &mut stats[label - 1];
    match entry {
      Some(s) => {
        s.min_x = s.min_x.min(x);
        s.min_y = s.min_y.min(y);
        s.max_x = s.max_x.max(x);
        s.max_y = s.max_y.max(y);
        s.area += 1;
      }
      None => {
        *entry = Some(RegionStats {
          min_x: x,
          min_y: y,
          max_x: x,
          max_y: y,
          area: 1,
        })
      }
    }
  }

  let mut regions: Vec<ChangeRegion> = stats
    .into_iter()
    .flatten()
    .filter(|s| s.area >= MIN_REGION_AREA)
    .map(|s| ChangeRegion {
      bbox: [s.min_x, s.min_y, s.max_x + 1, s.max_y + 1],
      change_type: DEFAULT_CHANGE_TYPE.to_string(),
      significance: (s.area as f32 / FULL_SIGNIFICANCE_AREA).min(1.0),
      area_px: s.area,
    })
    .collect();
  regions.sort_by_key(|r| (r.bbox[1], r.bbox[0]));
  regions
}

pub fn change_percentage(mask: &GrayImage) -> f64 {
  let total = mask.width() as u64 * mask.height() as u64;
  if total == 0 {
    return 0.0;
  }
  let changed = mask.pixels().filter(|p| p[0] != BACKGROUND).count() as u64;
  changed as f64 / total as f64 * 100.0
}

pub fn encode_mask(mask: &GrayImage) -> Result<Vec<u8>, ChangeError> {
  let mut buf = Cursor::new(Vec::new());
  mask.write_to(&mut buf, ImageFormat::Png)?;
  Ok(buf.into_inner())
}

pub fn analyze_change(
  before: &Raster,
  after: &Raster,
  sensitivity: f32,
) -> Result<ChangeResult, ChangeError> {
  if before.is_empty() || after.is_empty() {
    return Err(ChangeError::EmptyRaster);
  }
  let now = Instant::now();

  let after = align(before, after);
  let diff = difference(before.as_rgb_image(), &after);
  let mask = clean(&threshold(&diff, sensitivity));
  let regions = extract_regions(&mask);
  let change_percentage = change_percentage(&mask);
  let mask_png = encode_mask(&mask)?;

  info!(
    "变化检测完成: 灵敏度={}, 变化比例={:.2}%, 区域数={}, 耗时: {:.2?}",
    effective_sensitivity(sensitivity),
    change_percentage,
    regions.len(),
    now.elapsed()
  );

  Ok(ChangeResult {
    mask_png,
    mask_width: mask.width(),
    mask_height: mask.height(),
    regions,
    change_percentage,
  })
}
