//! HTTPサーバー
//!
//! クライアントからのHTTP/1.1接続の受け付け、リクエストのパース、
//! パイプラインの起動、レスポンスの書き出しを担います。
//! ワーカースレッドごとにSO_REUSEPORTでlistenし、接続ごとに
//! タスクをspawnします。

use crate::cache::headers::Headers;
use crate::error::Error;
use crate::middleware::{self, AppState, ResponseOut};
use crate::upstream::{is_chunked_encoding, ChunkedBodyDecoder};
use ftlog::{error, info, warn};
use httparse::{Request, Status};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::{TcpListener, TcpStream};
use monoio::time::timeout;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BUF_SIZE: usize = 65536;
const MAX_HEADER_SIZE: usize = 8192;
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

static ERR_MSG_BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
static ERR_MSG_REQUEST_TOO_LARGE: &[u8] =
    b"HTTP/1.1 413 Request Entity Too Large\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// パース済みのクライアントリクエスト
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub method: String,
    /// Hostヘッダーの値（ポート含む場合あり）
    pub host: String,
    /// クエリを除いたパス
    pub path: String,
    /// `?`を除いたクエリ文字列
    pub query: String,
    /// パス+クエリ（Request-URI）
    pub uri: String,
    pub proto: String,
    pub client_ip: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl RequestMeta {
    /// クエリパラメータの値を取得
    pub fn query_param(&self, name: &str) -> Option<&str> {
        for pair in self.query.split('&') {
            if let Some((k, v)) = pair.split_once('=') {
                if k == name {
                    return Some(v);
                }
            } else if pair == name {
                return Some("");
            }
        }
        None
    }
}

/// パースされたリクエストヘッダー部
struct ParsedRequestHead {
    meta: RequestMeta,
    header_len: usize,
    content_length: usize,
    is_chunked: bool,
    wants_close: bool,
}

/// リクエストヘッダーをパース
///
/// ヘッダーが未完なら`Ok(None)`。
fn parse_request_head(data: &[u8], peer_ip: &str) -> Result<Option<ParsedRequestHead>, ()> {
    let mut headers_storage = [httparse::EMPTY_HEADER; 64];
    let mut req = Request::new(&mut headers_storage);
    let header_len = match req.parse(data) {
        Ok(Status::Complete(len)) => len,
        Ok(Status::Partial) => return Ok(None),
        Err(_) => return Err(()),
    };

    let method = req.method.unwrap_or("GET").to_string();
    let uri = req.path.unwrap_or("/").to_string();
    let proto = match req.version {
        Some(0) => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
    .to_string();

    let (path, query) = match uri.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (uri.clone(), String::new()),
    };

    let mut headers = Headers::new();
    let mut host = String::new();
    let mut content_length = 0usize;
    let mut is_chunked = false;
    let mut wants_close = proto == "HTTP/1.0";
    for h in req.headers.iter() {
        if h.name.is_empty() {
            continue;
        }
        let value = String::from_utf8_lossy(h.value);
        if h.name.eq_ignore_ascii_case("host") {
            host = value.to_string();
        } else if h.name.eq_ignore_ascii_case("content-length") {
            content_length = value.trim().parse().unwrap_or(0);
        } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
            is_chunked = is_chunked_encoding(h.value);
        } else if h.name.eq_ignore_ascii_case("connection") {
            let value = value.trim();
            if value.eq_ignore_ascii_case("close") {
                wants_close = true;
            } else if value.eq_ignore_ascii_case("keep-alive") {
                wants_close = false;
            }
        }
        headers.append(h.name, &value);
    }

    // クライアントIP: 前段プロキシのヘッダーを優先
    let client_ip = headers
        .get("X-Forwarded-For")
        .and_then(|xff| xff.split(',').next())
        .map(|ip| ip.trim().to_string())
        .or_else(|| headers.get("X-Real-Ip").map(|ip| ip.to_string()))
        .unwrap_or_else(|| peer_ip.to_string());

    Ok(Some(ParsedRequestHead {
        meta: RequestMeta {
            method,
            host,
            path,
            query,
            uri,
            proto,
            client_ip,
            headers,
            body: Vec::new(),
        },
        header_len,
        content_length,
        is_chunked,
        wants_close,
    }))
}

fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Request Entity Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// レスポンスをワイヤ形式へ
fn serialize_response(out: &ResponseOut, keep_alive: bool, is_head: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256 + out.body.len());
    let mut num_buf = itoa::Buffer::new();
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(num_buf.format(out.status_code).as_bytes());
    let reason = status_text(out.status_code);
    if !reason.is_empty() {
        buf.push(b' ');
        buf.extend_from_slice(reason.as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
    for (name, value) in out.headers.iter() {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    // 304/204にContent-Lengthは不要
    if out.status_code != 304 && out.status_code != 204 {
        buf.extend_from_slice(b"Content-Length: ");
        buf.extend_from_slice(num_buf.format(out.body.len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    if keep_alive {
        buf.extend_from_slice(b"Connection: keep-alive\r\n\r\n");
    } else {
        buf.extend_from_slice(b"Connection: close\r\n\r\n");
    }
    if !is_head && out.status_code != 304 && out.status_code != 204 {
        buf.extend_from_slice(&out.body);
    }
    buf
}

/// SO_REUSEPORT付きのリスナーを作成
pub fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let config = monoio::net::ListenerConfig::default()
        .reuse_port(true)
        .backlog(8192);
    TcpListener::bind_with_config(addr, &config)
}

/// ワーカーのacceptループ
///
/// シャットダウンフラグを1秒おきに確認しながらacceptし続けます。
pub async fn accept_loop(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: &'static AtomicBool,
    thread_id: usize,
) {
    info!("[worker {}] started", thread_id);
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("[worker {}] shutting down", thread_id);
            return;
        }
        let accepted = timeout(Duration::from_secs(1), listener.accept()).await;
        let (stream, peer_addr) = match accepted {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                error!("[worker {}] accept error: {}", thread_id, e);
                continue;
            }
            // タイムアウトはシャットダウン確認のための定期的な戻り
            Err(_) => continue,
        };
        let _ = stream.set_nodelay(true);
        let state = state.clone();
        monoio::spawn(async move {
            handle_connection(stream, state, peer_addr).await;
        });
    }
}

/// 1コネクションの処理ループ（keep-alive対応）
pub async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>, peer_addr: SocketAddr) {
    let peer_ip = peer_addr.ip().to_string();
    let mut accumulated: Vec<u8> = Vec::with_capacity(BUF_SIZE);

    loop {
        // ヘッダーが揃うまで読む
        let head = loop {
            match parse_request_head(&accumulated, &peer_ip) {
                Ok(Some(head)) => break head,
                Ok(None) => {
                    if accumulated.len() > MAX_HEADER_SIZE {
                        let _ = timeout(
                            WRITE_TIMEOUT,
                            stream.write_all(ERR_MSG_REQUEST_TOO_LARGE.to_vec()),
                        )
                        .await;
                        return;
                    }
                }
                Err(()) => {
                    let _ =
                        timeout(WRITE_TIMEOUT, stream.write_all(ERR_MSG_BAD_REQUEST.to_vec())).await;
                    return;
                }
            }
            let buf = vec![0u8; BUF_SIZE];
            let read_timeout = if accumulated.is_empty() {
                IDLE_TIMEOUT
            } else {
                READ_TIMEOUT
            };
            let (res, buf) = match timeout(read_timeout, stream.read(buf)).await {
                Ok(result) => result,
                Err(_) => return,
            };
            let n = match res {
                Ok(0) => return,
                Ok(n) => n,
                Err(_) => return,
            };
            accumulated.extend_from_slice(&buf[..n]);
        };

        let mut meta = head.meta;
        let mut rest = accumulated.split_off(head.header_len);
        accumulated.clear();

        // ボディの読み込み
        if head.is_chunked {
            let mut decoder = ChunkedBodyDecoder::new();
            let mut complete = decoder.feed(&rest);
            while !complete {
                let buf = vec![0u8; BUF_SIZE];
                let (res, buf) = match timeout(READ_TIMEOUT, stream.read(buf)).await {
                    Ok(result) => result,
                    Err(_) => return,
                };
                let n = match res {
                    Ok(0) => return,
                    Ok(n) => n,
                    Err(_) => return,
                };
                complete = decoder.feed(&buf[..n]);
                if decoder.body_len() > MAX_BODY_SIZE {
                    let _ = timeout(
                        WRITE_TIMEOUT,
                        stream.write_all(ERR_MSG_REQUEST_TOO_LARGE.to_vec()),
                    )
                    .await;
                    return;
                }
            }
            meta.body = decoder.into_body();
        } else if head.content_length > 0 {
            if head.content_length > MAX_BODY_SIZE {
                let _ = timeout(
                    WRITE_TIMEOUT,
                    stream.write_all(ERR_MSG_REQUEST_TOO_LARGE.to_vec()),
                )
                .await;
                return;
            }
            while rest.len() < head.content_length {
                let buf = vec![0u8; BUF_SIZE];
                let (res, buf) = match timeout(READ_TIMEOUT, stream.read(buf)).await {
                    Ok(result) => result,
                    Err(_) => return,
                };
                let n = match res {
                    Ok(0) => return,
                    Ok(n) => n,
                    Err(_) => return,
                };
                rest.extend_from_slice(&buf[..n]);
            }
            rest.truncate(head.content_length);
            meta.body = rest;
        }

        let is_head = meta.method == "HEAD";
        let out = middleware::handle_request(&state, meta).await;

        let keep_alive = !head.wants_close && !crate::is_shutting_down();
        let response = serialize_response(&out, keep_alive, is_head);
        match timeout(WRITE_TIMEOUT, stream.write_all(response)).await {
            Ok((Ok(_), _)) => {}
            Ok((Err(e), _)) => {
                warn!("response write error: {}", e);
                return;
            }
            Err(_) => return,
        }
        if !keep_alive {
            return;
        }
    }
}

/// listenアドレス表記をSocketAddrへ
///
/// `:3015` のようなホスト省略形は0.0.0.0扱いになります。
pub fn parse_listen_addr(listen: &str) -> Result<SocketAddr, Error> {
    let normalized = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };
    normalized
        .parse()
        .map_err(|_| Error::Config(format!("invalid listen address: {}", listen)))
}
