//! 圧縮コーデック
//!
//! キャッシュレコードのボディに対するgzip/brotliの圧縮・解凍を
//! 提供します。レベル0は「ライブラリのデフォルト」を意味します
//! （gzipはデフォルトレベル、brotliは品質9）。

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// brotliのデフォルト品質
const DEFAULT_BROTLI_QUALITY: i32 = 9;

/// gzip圧縮
///
/// levelが0以下の場合はデフォルトレベルを使用します。
pub fn gzip(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let compression = if level <= 0 {
        Compression::default()
    } else {
        // flate2のレベル上限は9
        Compression::new((level as u32).min(9))
    };
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), compression);
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// gzip解凍
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// brotli圧縮
///
/// qualityが0の場合は品質9を使用します。
pub fn brotli_encode(data: &[u8], quality: i32) -> Result<Vec<u8>> {
    let quality = if quality <= 0 {
        DEFAULT_BROTLI_QUALITY
    } else {
        quality.min(11)
    };
    let params = brotli::enc::BrotliEncoderParams {
        quality,
        ..Default::default()
    };
    let mut input = std::io::Cursor::new(data);
    let mut out = Vec::with_capacity(data.len() / 2);
    brotli::BrotliCompress(&mut input, &mut out, &params)
        .map_err(|e| Error::Upstream(format!("brotli encode fail: {}", e)))?;
    Ok(out)
}

/// brotli解凍
pub fn brotli_decode(data: &[u8]) -> Result<Vec<u8>> {
    let mut input = std::io::Cursor::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    brotli::BrotliDecompress(&mut input, &mut out)
        .map_err(|e| Error::Upstream(format!("brotli decode fail: {}", e)))?;
    Ok(out)
}
