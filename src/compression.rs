// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 压缩协商模块
//!
//! - 解析 `Accept-Encoding`（含 q 值），选出服务端支持的最优编码；
//! - 使用 `flate2` / `brotli` 对响应体进行压缩；
//! - 已压缩的媒体类型（图片、音视频、压缩包、字体）直接跳过。

use std::io::{self, Write};

use brotli::enc::{self, backward_references::BrotliEncoderParams};
use flate2::{
    write::{DeflateEncoder, GzEncoder},
    Compression,
};
use log::debug;

use crate::param::HttpEncoding;

/// q 值相同时的服务端偏好顺序
const PREFERENCE: [HttpEncoding; 3] = [HttpEncoding::Gzip, HttpEncoding::Deflate, HttpEncoding::Br];

/// 根据 `Accept-Encoding` 选择编码，`None` 表示不压缩
///
/// `*` 视为接受任意编码；`q=0` 表示明确拒绝。
pub fn decide_encoding(accept_encoding: &str) -> Option<HttpEncoding> {
    let mut best: Option<(HttpEncoding, f32)> = None;
    let mut wildcard: Option<f32> = None;
    let mut rejected = Vec::new();
    let mut listed = Vec::new();

    for part in accept_encoding.split(',') {
        let mut pieces = part.trim().split(';');
        let coding = pieces.next().unwrap_or("").trim().to_ascii_lowercase();
        if coding.is_empty() {
            continue;
        }
        let q = pieces
            .filter_map(|p| p.trim().strip_prefix("q="))
            .filter_map(|q| q.trim().parse::<f32>().ok())
            .next()
            .unwrap_or(1.0);

        let encoding = match coding.as_str() {
            "gzip" | "x-gzip" => HttpEncoding::Gzip,
            "deflate" => HttpEncoding::Deflate,
            "br" => HttpEncoding::Br,
            "*" => {
                wildcard = Some(q);
                continue;
            }
            _ => continue,
        };
        listed.push(encoding);
        if q <= 0.0 {
            rejected.push(encoding);
            continue;
        }
        best = match best {
            Some((current, best_q)) if best_q > q => Some((current, best_q)),
            Some((current, best_q)) if best_q == q && rank(current) < rank(encoding) => {
                Some((current, best_q))
            }
            _ => Some((encoding, q)),
        };
    }

    if best.is_none() {
        if let Some(q) = wildcard {
            if q > 0.0 {
                return PREFERENCE
                    .iter()
                    .copied()
                    .find(|e| !rejected.contains(e) && !listed.contains(e));
            }
        }
    }
    best.map(|(encoding, _)| encoding)
}

fn rank(encoding: HttpEncoding) -> usize {
    PREFERENCE.iter().position(|e| *e == encoding).unwrap_or(PREFERENCE.len())
}

/// 压缩数据，`None` 原样返回
pub fn compress(data: Vec<u8>, mode: Option<HttpEncoding>) -> io::Result<Vec<u8>> {
    let original_size = data.len();
    let result = match mode {
        Some(HttpEncoding::Gzip) => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&data)?;
            encoder.finish()
        }
        Some(HttpEncoding::Deflate) => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&data)?;
            encoder.finish()
        }
        Some(HttpEncoding::Br) => {
            let params = BrotliEncoderParams::default();
            let mut output = Vec::new();
            enc::BrotliCompress(&mut io::Cursor::new(data), &mut output, &params)?;
            Ok(output)
        }
        None => Ok(data),
    };

    if let Ok(ref compressed) = result {
        let compressed_size = compressed.len();
        let ratio = if original_size > 0 {
            ((original_size as i64 - compressed_size as i64) as f64 / original_size as f64) * 100.0
        } else {
            0.0
        };
        debug!(
            "压缩完成: {:?}, 原始大小: {} bytes, 压缩后: {} bytes, 压缩率: {:.1}%",
            mode, original_size, compressed_size, ratio
        );
    }

    result
}

/// 已经压缩过的媒体类型不再压缩
pub fn should_skip_compression(mime_type: &str) -> bool {
    let skip_types = [
        "image/jpeg",
        "image/png",
        "image/gif",
        "image/webp",
        "image/bmp",
        "image/x-icon",
        "video/",
        "audio/",
        "application/zip",
        "application/x-7z-compressed",
        "application/gzip",
        "application/x-gzip",
        "font/woff",
        "font/woff2",
    ];

    skip_types
        .iter()
        .any(|&skip_type| mime_type.starts_with(skip_type))
}
