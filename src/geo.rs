// 该文件是 Orbital Eye （轨道之眼） 项目的一部分。
// src/geo.rs - 像素坐标到地理坐标的换算
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

use serde::{Deserialize, Serialize};

/// 赤道附近每度纬度对应的米数
pub const METERS_PER_DEGREE: f64 = 111_320.0;
pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPoint {
  pub latitude: f64,
  pub longitude: f64,
}

impl GeoPoint {
  pub fn new(latitude: f64, longitude: f64) -> Self {
    Self {
      latitude,
      longitude,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBBox {
  pub west: f64,
  pub south: f64,
  pub east: f64,
  pub north: f64,
}

/// 以左上角为参考点，把像素坐标换算为经纬度。
///
/// 这是局部平面近似：行号向南增长，列号向东增长。纬度为 ±90° 时
/// 经度方向除以 cos(90°)，结果为无穷大，不做截断。
pub fn pixel_to_geo(cx: f64, cy: f64, gsd_meters: f64, top_left: GeoPoint) -> GeoPoint {
  let gsd_deg_lat = gsd_meters / METERS_PER_DEGREE;
  let gsd_deg_lon = gsd_meters / (METERS_PER_DEGREE * top_left.latitude.to_radians().cos());

  GeoPoint {
    latitude: top_left.latitude - cy * gsd_deg_lat,
    longitude: top_left.longitude + cx * gsd_deg_lon,
  }
}

/// 两点间大圆距离（千米）
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
  let d_lat = (b.latitude - a.latitude).to_radians();
  let d_lon = (b.longitude - a.longitude).to_radians();
  let a_lat = a.latitude.to_radians();
  let b_lat = b.latitude.to_radians();

  let sin_d_lat = (d_lat / 2.0).sin();
  let sin_d_lon = (d_lon / 2.0).sin();
  let h = sin_d_lat * sin_d_lat + a_lat.cos() * b_lat.cos() * sin_d_lon * sin_d_lon;
  2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

pub fn bbox_from_center(center: GeoPoint, radius_km: f64) -> GeoBBox {
  let d_lat = (radius_km / EARTH_RADIUS_KM).to_degrees();
  let d_lon = (radius_km / (EARTH_RADIUS_KM * center.latitude.to_radians().cos())).to_degrees();
  GeoBBox {
    west: center.longitude - d_lon,
    south: center.latitude - d_lat,
    east: center.longitude + d_lon,
    north: center.latitude + d_lat,
  }
}
