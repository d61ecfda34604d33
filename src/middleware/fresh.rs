//! freshチェックステージ
//!
//! クライアントの条件付きリクエスト（If-None-Match /
//! If-Modified-Since）とレスポンスの検証子を比較し、クライアントの
//! 持つコピーが最新であればfreshフラグを立てます。dispatcherは
//! freshなリクエストへ304を返します。

use super::{AppState, Context};
use crate::error::Result;
use once_cell::sync::Lazy;
use std::sync::Arc;
use time::format_description::OwnedFormatItem;
use time::PrimitiveDateTime;

/// HTTP-date（IMF-fixdate）のパース用フォーマット
static HTTP_DATE_FORMAT: Lazy<OwnedFormatItem> = Lazy::new(|| {
    time::format_description::parse_owned::<2>(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT",
    )
    .unwrap()
});

fn parse_http_date(value: &str) -> Option<PrimitiveDateTime> {
    PrimitiveDateTime::parse(value, &*HTTP_DATE_FORMAT).ok()
}

/// ETag同士の弱い比較（W/プレフィックスを無視）
fn etag_weak_match(a: &str, b: &str) -> bool {
    let a = a.strip_prefix("W/").unwrap_or(a);
    let b = b.strip_prefix("W/").unwrap_or(b);
    !a.is_empty() && a == b
}

/// If-None-Match値（カンマ区切り・`*`対応）との照合
fn if_none_match(header: &str, etag: &str) -> bool {
    header
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || etag_weak_match(candidate, etag))
}

/// If-Modified-Sinceとの照合
///
/// HTTP-dateとしてパースできなければ文字列一致にフォールバックします。
fn not_modified_since(if_modified_since: &str, last_modified: &str) -> bool {
    match (
        parse_http_date(if_modified_since),
        parse_http_date(last_modified),
    ) {
        (Some(ims), Some(lm)) => lm <= ims,
        _ => if_modified_since == last_modified,
    }
}

pub fn fresh_checker(_state: &Arc<AppState>, ctx: &mut Context) -> Result<()> {
    if ctx.req.method != "GET" && ctx.req.method != "HEAD" {
        return Ok(());
    }
    // 成功レスポンスだけが条件付きリクエストの対象
    if !(200..300).contains(&ctx.resp.status_code) {
        return Ok(());
    }

    if let (Some(inm), Some(etag)) = (
        ctx.req.headers.get("If-None-Match"),
        ctx.resp.header.get("ETag"),
    ) {
        ctx.fresh = if_none_match(inm, etag);
        return Ok(());
    }

    if let (Some(ims), Some(lm)) = (
        ctx.req.headers.get("If-Modified-Since"),
        ctx.resp.header.get("Last-Modified"),
    ) {
        ctx.fresh = not_modified_since(ims, lm);
    }
    Ok(())
}
