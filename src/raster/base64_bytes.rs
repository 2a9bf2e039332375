// 该文件是 Orbital Eye （轨道之眼） 项目的一部分。
// src/raster/base64_bytes.rs - 字节字段的 base64 序列化
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

//! 用于 `#[serde(with = "...")]`，把 `Vec<u8>` 编码为标准 base64 字符串

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serializer};

/// 原始字节数编码后的 base64 长度
pub const fn encoded_len(raw: usize) -> usize {
  raw.div_ceil(3) * 4
}

pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_str(&STANDARD.encode(data))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
  let text = String::deserialize(deserializer)?;
  STANDARD
    .decode(text.as_bytes())
    .map_err(|e| D::Error::custom(format!("base64 解码失败: {}", e)))
}

pub mod option {
  use super::*;

  pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    match data {
      Some(data) => serializer.serialize_some(&STANDARD.encode(data)),
      None => serializer.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<Option<Vec<u8>>, D::Error> {
    Option::<String>::deserialize(deserializer)?
      .map(|text| {
        STANDARD
          .decode(text.as_bytes())
          .map_err(|e| D::Error::custom(format!("base64 解码失败: {}", e)))
      })
      .transpose()
  }
}
