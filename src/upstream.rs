//! upstream HTTP/1.1クライアント
//!
//! backendへのリクエスト転送を担う薄いHTTP/1.1クライアントです。
//! スレッドローカルなコネクションプールで接続を再利用し、
//! レスポンスはhttparseでパースします。chunked転送のボディは
//! ステートマシンでデコードして平坦なバイト列に戻します。

use crate::error::{Error, Result};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use monoio::time::timeout;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const BUF_SIZE: usize = 65536;
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
// upstreamレスポンスの上限（10MB）
const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

// コネクションプール設定
const POOL_MAX_IDLE_PER_HOST: usize = 8;
const POOL_IDLE_TIMEOUT_SECS: u64 = 10;

/// パース済みbackend URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamUrl {
    pub host: String,
    pub port: u16,
    /// backend URL自体が持つパスプレフィックス
    pub path_prefix: String,
}

impl UpstreamUrl {
    /// `http://host[:port][/prefix]` 形式をパース
    ///
    /// TLS終端はこのプロキシの責務外のため、httpスキームのみを
    /// 受け付けます。
    pub fn parse(url: &str) -> Result<UpstreamUrl> {
        let rest = url
            .strip_prefix("http://")
            .ok_or_else(|| Error::ParseBackendUrlFail(url.to_string()))?;

        let (host_port, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if host_port.is_empty() {
            return Err(Error::ParseBackendUrlFail(url.to_string()));
        }

        let (host, port) = match host_port.find(':') {
            Some(idx) => {
                let port = host_port[idx + 1..]
                    .parse()
                    .map_err(|_| Error::ParseBackendUrlFail(url.to_string()))?;
                (host_port[..idx].to_string(), port)
            }
            None => (host_port.to_string(), 80),
        };

        Ok(UpstreamUrl {
            host,
            port,
            path_prefix: path.trim_end_matches('/').to_string(),
        })
    }

    /// Hostヘッダー用の表記
    pub fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 転送するリクエスト
pub struct UpstreamRequest<'a> {
    pub method: &'a str,
    /// rewrite適用済みのパス（クエリ含む）
    pub path: &'a str,
    /// 転送するヘッダー（hop-by-hopは除外済みであること）
    pub headers: Vec<(String, String)>,
    pub body: &'a [u8],
}

/// upstreamからのレスポンス
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status_code: u16,
    /// 受信順・大文字小文字そのままのヘッダー
    pub headers: Vec<(String, String)>,
    /// chunkedをデコードした後のボディ
    pub body: Vec<u8>,
}

/// プールされた接続
struct PooledConnection {
    stream: TcpStream,
    idle_since: Instant,
}

impl PooledConnection {
    fn is_valid(&self) -> bool {
        self.idle_since.elapsed().as_secs() < POOL_IDLE_TIMEOUT_SECS
    }
}

thread_local! {
    static POOL: RefCell<HashMap<String, VecDeque<PooledConnection>>> =
        RefCell::new(HashMap::new());
}

fn pool_get(key: &str) -> Option<TcpStream> {
    POOL.with(|p| {
        let mut pool = p.borrow_mut();
        let queue = pool.get_mut(key)?;
        while let Some(entry) = queue.pop_front() {
            if entry.is_valid() {
                return Some(entry.stream);
            }
        }
        None
    })
}

fn pool_put(key: &str, stream: TcpStream) {
    POOL.with(|p| {
        let mut pool = p.borrow_mut();
        let queue = pool.entry(key.to_string()).or_default();
        while queue.len() >= POOL_MAX_IDLE_PER_HOST {
            queue.pop_front();
        }
        queue.push_back(PooledConnection {
            stream,
            idle_since: Instant::now(),
        });
    });
}

/// リクエストをHTTP/1.1のワイヤ形式へ
fn serialize_request(target: &UpstreamUrl, req: &UpstreamRequest<'_>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(512 + req.body.len());
    buf.extend_from_slice(req.method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(req.path.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    buf.extend_from_slice(target.host_header().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for (name, value) in &req.headers {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    if !req.body.is_empty() || matches!(req.method, "POST" | "PUT" | "PATCH") {
        let mut num_buf = itoa::Buffer::new();
        buf.extend_from_slice(b"Content-Length: ");
        buf.extend_from_slice(num_buf.format(req.body.len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"Connection: keep-alive\r\n\r\n");
    buf.extend_from_slice(req.body);
    buf
}

/// chunkedボディのデコーダ
///
/// RFC 7230 Section 4.1のチャンク構文をバイト単位で処理し、
/// ペイロードのみを取り出します。トレーラーは読み捨てます。
#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkedState {
    ReadingChunkSize,
    ReadingChunkExtension,
    ExpectingChunkSizeLf,
    ReadingChunkData,
    ExpectingChunkDataCr,
    ExpectingChunkDataLf,
    ReadingTrailerLine,
    ExpectingTrailerLf,
    Complete,
}

pub struct ChunkedBodyDecoder {
    state: ChunkedState,
    chunk_remaining: u64,
    size_accumulator: u64,
    size_has_digit: bool,
    trailer_line_empty: bool,
    body: Vec<u8>,
}

impl ChunkedBodyDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkedState::ReadingChunkSize,
            chunk_remaining: 0,
            size_accumulator: 0,
            size_has_digit: false,
            trailer_line_empty: true,
            body: Vec::new(),
        }
    }

    /// データをフィードして状態を更新。完了したらtrue
    pub fn feed(&mut self, data: &[u8]) -> bool {
        for &byte in data {
            if self.feed_byte(byte) {
                return true;
            }
        }
        self.state == ChunkedState::Complete
    }

    /// デコード済みボディを取り出す
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    pub fn is_complete(&self) -> bool {
        self.state == ChunkedState::Complete
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    #[inline]
    fn feed_byte(&mut self, byte: u8) -> bool {
        match self.state {
            ChunkedState::ReadingChunkSize => match byte {
                b'0'..=b'9' => {
                    self.size_accumulator = self
                        .size_accumulator
                        .saturating_mul(16)
                        .saturating_add(u64::from(byte - b'0'));
                    self.size_has_digit = true;
                }
                b'a'..=b'f' => {
                    self.size_accumulator = self
                        .size_accumulator
                        .saturating_mul(16)
                        .saturating_add(u64::from(byte - b'a' + 10));
                    self.size_has_digit = true;
                }
                b'A'..=b'F' => {
                    self.size_accumulator = self
                        .size_accumulator
                        .saturating_mul(16)
                        .saturating_add(u64::from(byte - b'A' + 10));
                    self.size_has_digit = true;
                }
                b';' => self.state = ChunkedState::ReadingChunkExtension,
                b'\r' => self.state = ChunkedState::ExpectingChunkSizeLf,
                _ => {}
            },
            ChunkedState::ReadingChunkExtension => {
                if byte == b'\r' {
                    self.state = ChunkedState::ExpectingChunkSizeLf;
                }
            }
            ChunkedState::ExpectingChunkSizeLf => {
                if byte == b'\n' {
                    if !self.size_has_digit {
                        self.state = ChunkedState::ReadingChunkSize;
                    } else if self.size_accumulator == 0 {
                        self.state = ChunkedState::ReadingTrailerLine;
                        self.trailer_line_empty = true;
                    } else {
                        self.chunk_remaining = self.size_accumulator;
                        self.state = ChunkedState::ReadingChunkData;
                    }
                    self.size_accumulator = 0;
                    self.size_has_digit = false;
                } else {
                    self.state = ChunkedState::ReadingChunkSize;
                    self.size_accumulator = 0;
                    self.size_has_digit = false;
                }
            }
            ChunkedState::ReadingChunkData => {
                self.body.push(byte);
                self.chunk_remaining = self.chunk_remaining.saturating_sub(1);
                if self.chunk_remaining == 0 {
                    self.state = ChunkedState::ExpectingChunkDataCr;
                }
            }
            ChunkedState::ExpectingChunkDataCr => {
                if byte == b'\r' {
                    self.state = ChunkedState::ExpectingChunkDataLf;
                } else {
                    self.state = ChunkedState::ReadingChunkSize;
                }
            }
            ChunkedState::ExpectingChunkDataLf => {
                self.state = ChunkedState::ReadingChunkSize;
            }
            ChunkedState::ReadingTrailerLine => {
                if byte == b'\r' {
                    self.state = ChunkedState::ExpectingTrailerLf;
                } else {
                    self.trailer_line_empty = false;
                }
            }
            ChunkedState::ExpectingTrailerLf => {
                if byte == b'\n' {
                    if self.trailer_line_empty {
                        self.state = ChunkedState::Complete;
                        return true;
                    }
                    self.state = ChunkedState::ReadingTrailerLine;
                    self.trailer_line_empty = true;
                } else {
                    self.state = ChunkedState::ReadingTrailerLine;
                    self.trailer_line_empty = false;
                }
            }
            ChunkedState::Complete => return true,
        }
        false
    }
}

/// パース済みレスポンスヘッダー
struct ParsedResponseHead {
    status_code: u16,
    headers: Vec<(String, String)>,
    header_len: usize,
    content_length: Option<usize>,
    is_chunked: bool,
    is_connection_close: bool,
}

fn parse_response_head(data: &[u8]) -> Result<Option<ParsedResponseHead>> {
    let mut headers_storage = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers_storage);
    match response.parse(data) {
        Ok(httparse::Status::Complete(header_len)) => {
            let status_code = response.code.unwrap_or(502);
            let mut headers = Vec::with_capacity(response.headers.len());
            let mut content_length = None;
            let mut is_chunked = false;
            let mut is_connection_close = false;
            for h in response.headers.iter() {
                if h.name.eq_ignore_ascii_case("content-length") {
                    content_length = std::str::from_utf8(h.value)
                        .ok()
                        .and_then(|s| s.trim().parse().ok());
                } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
                    is_chunked = is_chunked_encoding(h.value);
                } else if h.name.eq_ignore_ascii_case("connection") {
                    is_connection_close = h.value.trim_ascii().eq_ignore_ascii_case(b"close");
                }
                headers.push((
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                ));
            }
            Ok(Some(ParsedResponseHead {
                status_code,
                headers,
                header_len,
                content_length,
                is_chunked,
                is_connection_close,
            }))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(Error::Upstream(format!("response parse fail: {}", e))),
    }
}

/// Transfer-Encodingヘッダー値がchunkedを含むか
pub fn is_chunked_encoding(value: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|part| part.trim_ascii().eq_ignore_ascii_case(b"chunked"))
}

/// upstreamへリクエストを送ってレスポンスを受信
///
/// プールされたkeep-alive接続を優先的に使い、再利用した接続が
/// 死んでいた場合は一度だけ新規接続で再試行します。
pub async fn fetch(
    target: &UpstreamUrl,
    req: &UpstreamRequest<'_>,
    connect_timeout: Duration,
) -> Result<UpstreamResponse> {
    let pool_key = target.addr();
    let request = serialize_request(target, req);
    let is_head = req.method.eq_ignore_ascii_case("HEAD");

    if let Some(stream) = pool_get(&pool_key) {
        match exchange(stream, &pool_key, request.clone(), is_head).await {
            Ok(resp) => return Ok(resp),
            // 再利用した接続での失敗は新規接続でやり直す
            Err(_) => {}
        }
    }

    let stream = connect(target, connect_timeout).await?;
    exchange(stream, &pool_key, request, is_head).await
}

async fn connect(target: &UpstreamUrl, connect_timeout: Duration) -> Result<TcpStream> {
    let addr = target.addr();
    match timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::Upstream(format!("connect {} fail: {}", addr, e))),
        Err(_) => Err(Error::GatewayTimeout),
    }
}

/// 1リクエスト分の送受信
async fn exchange(
    mut stream: TcpStream,
    pool_key: &str,
    request: Vec<u8>,
    is_head: bool,
) -> Result<UpstreamResponse> {
    let (res, _) = timeout(WRITE_TIMEOUT, stream.write_all(request))
        .await
        .map_err(|_| Error::GatewayTimeout)?;
    res.map_err(|e| Error::Upstream(format!("write fail: {}", e)))?;

    let mut accumulated: Vec<u8> = Vec::with_capacity(BUF_SIZE);
    let mut head: Option<ParsedResponseHead> = None;

    // ヘッダーが揃うまで読む
    loop {
        let buf = vec![0u8; BUF_SIZE];
        let (res, buf) = timeout(READ_TIMEOUT, stream.read(buf))
            .await
            .map_err(|_| Error::GatewayTimeout)?;
        let n = res.map_err(|e| Error::Upstream(format!("read fail: {}", e)))?;
        if n == 0 {
            return Err(Error::Upstream("connection closed by upstream".into()));
        }
        accumulated.extend_from_slice(&buf[..n]);
        if accumulated.len() > MAX_RESPONSE_SIZE {
            return Err(Error::Upstream("response too large".into()));
        }
        if let Some(parsed) = parse_response_head(&accumulated)? {
            head = Some(parsed);
            break;
        }
    }
    let head = head.unwrap();
    let mut body_part = accumulated.split_off(head.header_len);

    // HEADへの応答と204/304はヘッダーの内容にかかわらずボディを持たない
    let has_body = !is_head && head.status_code != 204 && head.status_code != 304;

    let (body, reusable) = if !has_body {
        (Vec::new(), true)
    } else if head.is_chunked {
        let mut decoder = ChunkedBodyDecoder::new();
        let mut complete = decoder.feed(&body_part);
        while !complete {
            let buf = vec![0u8; BUF_SIZE];
            let (res, buf) = timeout(READ_TIMEOUT, stream.read(buf))
                .await
                .map_err(|_| Error::GatewayTimeout)?;
            let n = res.map_err(|e| Error::Upstream(format!("read fail: {}", e)))?;
            if n == 0 {
                return Err(Error::Upstream("truncated chunked body".into()));
            }
            complete = decoder.feed(&buf[..n]);
            if decoder.body_len() > MAX_RESPONSE_SIZE {
                return Err(Error::Upstream("response too large".into()));
            }
        }
        (decoder.into_body(), true)
    } else if let Some(content_length) = head.content_length {
        if content_length > MAX_RESPONSE_SIZE {
            return Err(Error::Upstream("response too large".into()));
        }
        while body_part.len() < content_length {
            let buf = vec![0u8; BUF_SIZE];
            let (res, buf) = timeout(READ_TIMEOUT, stream.read(buf))
                .await
                .map_err(|_| Error::GatewayTimeout)?;
            let n = res.map_err(|e| Error::Upstream(format!("read fail: {}", e)))?;
            if n == 0 {
                return Err(Error::Upstream("truncated body".into()));
            }
            body_part.extend_from_slice(&buf[..n]);
        }
        body_part.truncate(content_length);
        (body_part, true)
    } else {
        // Content-LengthもchunkedもなければEOFまで
        loop {
            let buf = vec![0u8; BUF_SIZE];
            let (res, buf) = timeout(READ_TIMEOUT, stream.read(buf))
                .await
                .map_err(|_| Error::GatewayTimeout)?;
            let n = res.map_err(|e| Error::Upstream(format!("read fail: {}", e)))?;
            if n == 0 {
                break;
            }
            body_part.extend_from_slice(&buf[..n]);
            if body_part.len() > MAX_RESPONSE_SIZE {
                return Err(Error::Upstream("response too large".into()));
            }
        }
        (body_part, false)
    };

    if reusable && !head.is_connection_close {
        pool_put(pool_key, stream);
    }

    Ok(UpstreamResponse {
        status_code: head.status_code,
        headers: head.headers,
        body,
    })
}

/// ヘルスチェック用の単発GET
///
/// プールを使わず、ステータスコードだけを読み取ります。probeの失敗が
/// リクエスト経路のプールに影響しないよう分離しています。
pub async fn probe(target: &UpstreamUrl, path: &str, probe_timeout: Duration) -> Option<u16> {
    let do_probe = async {
        let addr = target.addr();
        let mut stream = TcpStream::connect(&addr).await.ok()?;
        let mut request = Vec::with_capacity(256);
        request.extend_from_slice(b"GET ");
        request.extend_from_slice(path.as_bytes());
        request.extend_from_slice(b" HTTP/1.1\r\nHost: ");
        request.extend_from_slice(target.host_header().as_bytes());
        request.extend_from_slice(b"\r\nConnection: close\r\n\r\n");
        let (res, _) = stream.write_all(request).await;
        res.ok()?;

        let mut accumulated: Vec<u8> = Vec::with_capacity(1024);
        loop {
            let buf = vec![0u8; 4096];
            let (res, buf) = stream.read(buf).await;
            let n = res.ok()?;
            if n == 0 {
                return None;
            }
            accumulated.extend_from_slice(&buf[..n]);
            let mut headers_storage = [httparse::EMPTY_HEADER; 64];
            let mut response = httparse::Response::new(&mut headers_storage);
            match response.parse(&accumulated) {
                Ok(httparse::Status::Complete(_)) => return response.code,
                Ok(httparse::Status::Partial) => {
                    if let Some(code) = response.code {
                        return Some(code);
                    }
                }
                Err(_) => return None,
            }
            if accumulated.len() > 16 * 1024 {
                return None;
            }
        }
    };
    match timeout(probe_timeout, do_probe).await {
        Ok(result) => result,
        Err(_) => None,
    }
}
