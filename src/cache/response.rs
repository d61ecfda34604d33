//! キャッシュレコード
//!
//! 永続化されるレスポンスのインメモリ表現とバイナリワイヤ形式を
//! 提供します。ワイヤ形式はリトルエンディアンの単一バッファで、
//! 固定長ヘッダ（24バイト）の後に、JSON化したHTTPヘッダー、
//! 生ボディ、gzipボディ、brボディが連続します。
//!
//! ```text
//! +--------+--------+--------+-----------+---------+---------+-------+
//! | u32    | u16    | u16    | u32       | u32     | u32     | u32   |
//! | created| status | ttl    | headerLen | bodyLen | gzipLen | brLen |
//! +--------+--------+--------+-----------+---------+---------+-------+
//! | header JSON | body | gzipBody | brBody |
//! +-------------+------+----------+--------+
//! ```

use super::codec;
use super::headers::Headers;
use crate::error::{Error, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// gzip/brotli圧縮対象の最小ボディサイズ（デフォルト）
pub const COMPRESS_MIN_LENGTH: usize = 1024;

/// gzipのエンコーディング名
pub const GZIP_ENCODING: &str = "gzip";
/// brotliのエンコーディング名
pub const BR_ENCODING: &str = "br";

/// 固定長部のサイズ
const FIXED_HEADER_LEN: usize = 24;

/// 現在時刻をUNIXエポック秒(u32)で取得
pub fn now_unix() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// キャッシュされるレスポンス
///
/// body / gzip_body / br_body のうち同時に値を持つのは最大2つ。
/// どの組み合わせを保存するかはdispatcherが決定します。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    /// 作成時刻（フェッチ開始時のエポック秒）
    pub created_at: u32,
    /// HTTPステータスコード
    pub status_code: u16,
    /// キャッシュ有効期間（秒）。0は「永続化しない」
    pub ttl: u16,
    /// HTTPレスポンスヘッダー
    pub header: Headers,
    /// 生ボディ
    pub body: Vec<u8>,
    /// gzip圧縮済みボディ
    pub gzip_body: Vec<u8>,
    /// brotli圧縮済みボディ
    pub br_body: Vec<u8>,
    /// 圧縮レベル [0, 11]。0はライブラリデフォルト
    pub compress_level: i32,
    /// 圧縮対象の最小ボディサイズ。0はデフォルト(1024)
    pub compress_min_length: usize,
}

impl Response {
    /// ワイヤ形式にエンコード
    ///
    /// created_atが0の場合は現在時刻を使用します。
    pub fn encode(&self) -> Result<Vec<u8>> {
        let created_at = if self.created_at == 0 {
            now_unix()
        } else {
            self.created_at
        };
        let header = serde_json::to_vec(&self.header)?;

        let mut buf = Vec::with_capacity(
            FIXED_HEADER_LEN
                + header.len()
                + self.body.len()
                + self.gzip_body.len()
                + self.br_body.len(),
        );
        buf.extend_from_slice(&created_at.to_le_bytes());
        buf.extend_from_slice(&self.status_code.to_le_bytes());
        buf.extend_from_slice(&self.ttl.to_le_bytes());
        buf.extend_from_slice(&(header.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.gzip_body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.br_body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&self.body);
        buf.extend_from_slice(&self.gzip_body);
        buf.extend_from_slice(&self.br_body);
        Ok(buf)
    }

    /// ワイヤ形式からデコード
    pub fn decode(data: &[u8]) -> Result<Response> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(Error::InvalidRecord);
        }
        let created_at = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let status_code = u16::from_le_bytes(data[4..6].try_into().unwrap());
        let ttl = u16::from_le_bytes(data[6..8].try_into().unwrap());
        let header_len = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
        let body_len = u32::from_le_bytes(data[12..16].try_into().unwrap()) as usize;
        let gzip_len = u32::from_le_bytes(data[16..20].try_into().unwrap()) as usize;
        let br_len = u32::from_le_bytes(data[20..24].try_into().unwrap()) as usize;

        let total = FIXED_HEADER_LEN
            .checked_add(header_len)
            .and_then(|n| n.checked_add(body_len))
            .and_then(|n| n.checked_add(gzip_len))
            .and_then(|n| n.checked_add(br_len))
            .ok_or(Error::InvalidRecord)?;
        if data.len() < total {
            return Err(Error::InvalidRecord);
        }

        let mut offset = FIXED_HEADER_LEN;
        let header: Headers = serde_json::from_slice(&data[offset..offset + header_len])?;
        offset += header_len;
        let body = data[offset..offset + body_len].to_vec();
        offset += body_len;
        let gzip_body = data[offset..offset + gzip_len].to_vec();
        offset += gzip_len;
        let br_body = data[offset..offset + br_len].to_vec();

        Ok(Response {
            created_at,
            status_code,
            ttl,
            header,
            body,
            gzip_body,
            br_body,
            compress_level: 0,
            compress_min_length: 0,
        })
    }

    /// 圧縮されていない生ボディを取得
    ///
    /// body / gzip_body / br_body の順で最初の非空バッファを
    /// （必要なら解凍して）返します。すべて空なら`ContentNotFound`。
    pub fn get_raw_body(&self) -> Result<Vec<u8>> {
        if !self.body.is_empty() {
            return Ok(self.body.clone());
        }
        if !self.gzip_body.is_empty() {
            return codec::gunzip(&self.gzip_body);
        }
        if !self.br_body.is_empty() {
            return codec::brotli_decode(&self.br_body);
        }
        Err(Error::ContentNotFound)
    }

    /// Accept-Encodingに応じてボディとエンコーディング名を取得
    ///
    /// 優先順位はbrotli、次にgzip。事前圧縮済みバッファがあれば
    /// そのまま返し、なければオンデマンドで圧縮します。圧縮に失敗
    /// した候補はスキップして次へ進みます。
    pub fn get_body(&self, accept_encoding: &str) -> (Vec<u8>, &'static str) {
        // 204はボディなし
        if self.status_code == 204 {
            return (Vec::new(), "");
        }
        let compress_min_length = if self.compress_min_length == 0 {
            COMPRESS_MIN_LENGTH
        } else {
            self.compress_min_length
        };
        // 生ボディが最小圧縮サイズ未満ならそのまま返す
        if !self.body.is_empty() && self.body.len() < compress_min_length {
            return (self.body.clone(), "");
        }
        let level = self.compress_level;
        for enc in [BR_ENCODING, GZIP_ENCODING] {
            if !accept_encoding.contains(enc) {
                continue;
            }
            if enc == BR_ENCODING {
                if !self.br_body.is_empty() {
                    return (self.br_body.clone(), BR_ENCODING);
                }
                let raw = match self.get_raw_body() {
                    Ok(raw) => raw,
                    Err(_) => continue,
                };
                match codec::brotli_encode(&raw, level) {
                    Ok(body) => return (body, BR_ENCODING),
                    Err(_) => continue,
                }
            } else {
                if !self.gzip_body.is_empty() {
                    return (self.gzip_body.clone(), GZIP_ENCODING);
                }
                let raw = match self.get_raw_body() {
                    Ok(raw) => raw,
                    Err(_) => continue,
                };
                match codec::gzip(&raw, level) {
                    Ok(body) => return (body, GZIP_ENCODING),
                    Err(_) => continue,
                }
            }
        }

        // マッチするencodingがなく、gzipバッファしか持っていない場合は
        // 解凍した生データを返す
        if self.body.is_empty() && !self.gzip_body.is_empty() {
            return (codec::gunzip(&self.gzip_body).unwrap_or_default(), "");
        }

        (self.body.clone(), "")
    }
}
