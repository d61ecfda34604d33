//! proxyステージ
//!
//! 選択されたdirectorのbackendへリクエストを転送し、レスポンスを
//! キャッシュレコードとしてコンテキストへ載せます。転送が必要なのは
//! ステータスがPass / Fetching / HitForPassの場合だけです。
//!
//! origin障害時、fetcherとしてキーを所有しているリクエストは
//! キーをhit for passへ遷移させてからエラーを伝播します。これにより
//! 後続のリクエストが落ちているoriginへ行列を作るのを防ぎます。

use super::{AppState, Context};
use crate::cache::headers::Headers;
use crate::cache::response::{now_unix, Response};
use crate::cache::status::Status;
use crate::error::{Error, Result};
use crate::upstream::{self, UpstreamRequest};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

static NO_CACHE_REG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"no-cache|no-store|private").unwrap());
static S_MAXAGE_REG: Lazy<Regex> = Lazy::new(|| Regex::new(r"s-maxage=(\d+)").unwrap());
static MAX_AGE_REG: Lazy<Regex> = Lazy::new(|| Regex::new(r"max-age=(\d+)").unwrap());

/// 転送時に落とすリクエストヘッダー
const SKIP_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "accept-encoding",
    "content-length",
];

/// レコードに保存しないレスポンスヘッダー
const SKIP_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "content-encoding",
];

/// Cache-ControlからキャッシュTTLを決める
///
/// no-cache / no-store / private は0。s-maxage優先、次にmax-age。
/// Set-Cookie付きレスポンスはキャッシュしません。
fn get_cache_age(headers: &Headers) -> u16 {
    if headers.contains("Set-Cookie") {
        return 0;
    }
    let cache_control = match headers.get("Cache-Control") {
        Some(value) => value,
        None => return 0,
    };
    if NO_CACHE_REG.is_match(cache_control) {
        return 0;
    }
    for reg in [&*S_MAXAGE_REG, &*MAX_AGE_REG] {
        if let Some(captures) = reg.captures(cache_control) {
            let age: u64 = captures[1].parse().unwrap_or(0);
            return age.min(u64::from(u16::MAX)) as u16;
        }
    }
    0
}

/// 弱いETagを生成
fn gen_etag(body: &[u8]) -> String {
    format!("W/\"{:x}-{:x}\"", body.len(), xxh3_64(body))
}

/// backendのパスプレフィックスとリクエストパスを結合
fn join_prefix(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else if path == "/" {
        format!("{}/", prefix)
    } else {
        format!("{}{}", prefix, path)
    }
}

pub async fn proxy(state: &Arc<AppState>, ctx: &mut Context) -> Result<()> {
    if !matches!(
        ctx.status,
        Status::Pass | Status::Fetching | Status::HitForPass
    ) {
        return Ok(());
    }
    let director = ctx.director.as_ref().ok_or(Error::DirectorUnavailable)?;

    let backend = director
        .select(&ctx.req.client_ip, &ctx.req.uri, &ctx.req.headers)
        .ok_or(Error::DirectorUnavailable)?;
    let target = director.get_target_url(&backend)?;

    let uri = director.rewrite(&ctx.req.uri);
    let path = join_prefix(&target.path_prefix, &uri);

    // 転送ヘッダー: hop-by-hopを除去し、director設定とX-Forwarded-Forを注入
    let mut headers: Vec<(String, String)> = Vec::with_capacity(ctx.req.headers.len() + 4);
    let mut forwarded_for: Option<String> = None;
    for (name, value) in ctx.req.headers.iter() {
        if name.eq_ignore_ascii_case("x-forwarded-for") {
            forwarded_for = Some(format!("{}, {}", value, ctx.req.client_ip));
            continue;
        }
        if SKIP_REQUEST_HEADERS
            .iter()
            .any(|skip| name.eq_ignore_ascii_case(skip))
        {
            continue;
        }
        headers.push((name.to_string(), value.to_string()));
    }
    for (name, value) in &director.request_header {
        headers.push((name.clone(), value.clone()));
    }
    headers.push((
        "X-Forwarded-For".to_string(),
        forwarded_for.unwrap_or_else(|| ctx.req.client_ip.clone()),
    ));
    // backendからは圧縮済みデータを受け取り、そのままレコードへ保存する
    headers.push(("Accept-Encoding".to_string(), "gzip".to_string()));

    let request = UpstreamRequest {
        method: &ctx.req.method,
        path: &path,
        headers,
        body: &ctx.req.body,
    };

    let result = upstream::fetch(target, &request, state.settings.connect_timeout).await;
    let up = match result {
        Ok(up) => up,
        Err(err) => {
            // fetcherだけがキーの状態に責任を持つ
            if ctx.status == Status::Fetching {
                state
                    .client
                    .hit_for_pass(&ctx.identity, state.settings.hit_for_pass_ttl);
            }
            return Err(err);
        }
    };

    let mut record = Response {
        created_at: now_unix(),
        status_code: up.status_code,
        ttl: 0,
        header: Headers::new(),
        compress_level: state.settings.compress_level,
        compress_min_length: state.settings.compress_min_length,
        ..Default::default()
    };

    let mut content_encoding = String::new();
    for (name, value) in &up.headers {
        if name.eq_ignore_ascii_case("content-encoding") {
            content_encoding = value.trim().to_ascii_lowercase();
        }
        if SKIP_RESPONSE_HEADERS
            .iter()
            .any(|skip| name.eq_ignore_ascii_case(skip))
        {
            continue;
        }
        record.header.append(name, value);
    }
    record.ttl = get_cache_age(&record.header);

    // Content-Encodingに応じて格納先バッファを選ぶ
    match content_encoding.as_str() {
        "gzip" => record.gzip_body = up.body,
        "br" => record.br_body = up.body,
        "" | "identity" => record.body = up.body,
        other => {
            // 未知のエンコーディングは不透明データとして素通しする
            record.header.set("Content-Encoding", other);
            record.body = up.body;
            record.ttl = 0;
        }
    }

    if state.settings.e_tag && record.status_code == 200 && !record.header.contains("ETag") {
        let etag = if !record.body.is_empty() {
            gen_etag(&record.body)
        } else {
            gen_etag(record.get_raw_body().as_deref().unwrap_or_default())
        };
        record.header.set("ETag", &etag);
    }

    ctx.resp = record;
    Ok(())
}
