//! dispatcherステージ
//!
//! パイプラインの最終段です。レスポンスの保存可否を判断して
//! バックグラウンドタスクへ回し、クライアントへ返すボディを
//! コンテンツネゴシエーションで決定します。保存処理がクライアントへの
//! 応答を遅らせることはありません。

use super::{AppState, Context};
use crate::cache::codec;
use crate::cache::response::{Response, COMPRESS_MIN_LENGTH};
use crate::cache::status::Status;
use crate::cache::CacheClient;
use crate::error::Result;
use regex::Regex;
use std::sync::Arc;

/// Content-Typeが圧縮対象か
fn should_compress(text_types: &[Regex], content_type: &str) -> bool {
    text_types.iter().any(|re| re.is_match(content_type))
}

/// 保存可否の判断と実行
///
/// レスポンス送出後のバックグラウンドタスクから呼ばれます。
fn store_decision(
    client: &CacheClient,
    key: &[u8],
    record: Response,
    status: Status,
    compressible: bool,
    hit_for_pass_ttl: u16,
) {
    if record.ttl == 0 {
        // TTLなしは永続化しない。負のキャッシュとして記録する
        if status != Status::HitForPass {
            client.hit_for_pass(key, hit_for_pass_ttl);
        }
        return;
    }
    save(client, key, record, compressible, hit_for_pass_ttl);
}

/// レコードを（必要なら圧縮して）永続化し、cacheableへ遷移させる
fn save(
    client: &CacheClient,
    key: &[u8],
    mut record: Response,
    compressible: bool,
    hit_for_pass_ttl: u16,
) {
    let ttl = record.ttl;
    let do_save = |record: &Response| {
        if client.save_response(key, record).is_ok() {
            client.cacheable(key, ttl);
        } else {
            // 保存に失敗したキーはpassさせる
            client.hit_for_pass(key, hit_for_pass_ttl);
        }
    };

    if record.status_code == 204 || !compressible {
        do_save(&record);
        return;
    }

    // 生ボディを確保する。backendから圧縮済みで受け取っている場合は
    // もう一方の圧縮形式を生成するために一度解凍する
    let mut body = record.body.clone();
    if body.is_empty() {
        if !record.gzip_body.is_empty() {
            match codec::gunzip(&record.gzip_body) {
                Ok(raw) => body = raw,
                Err(_) => {
                    do_save(&record);
                    return;
                }
            }
        } else if !record.br_body.is_empty() {
            match codec::brotli_decode(&record.br_body) {
                Ok(raw) => body = raw,
                Err(_) => {
                    do_save(&record);
                    return;
                }
            }
        }
    }
    if body.is_empty() {
        client.hit_for_pass(key, hit_for_pass_ttl);
        return;
    }

    let compress_min_length = if record.compress_min_length == 0 {
        COMPRESS_MIN_LENGTH
    } else {
        record.compress_min_length
    };
    if body.len() < compress_min_length {
        do_save(&record);
        return;
    }

    let level = record.compress_level;
    if record.gzip_body.is_empty() {
        if let Ok(gzip_body) = codec::gzip(&body, level) {
            // gzipがあれば生ボディは落としてサイズを節約する
            record.gzip_body = gzip_body;
            record.body.clear();
        }
    }
    if record.br_body.is_empty() {
        record.br_body = codec::brotli_encode(&body, level).unwrap_or_default();
    }
    do_save(&record);
}

pub fn dispatcher(state: &Arc<AppState>, ctx: &mut Context) -> Result<()> {
    let record = &mut ctx.resp;
    record.compress_level = state.settings.compress_level;
    record.compress_min_length = state.settings.compress_min_length;

    let compressible = should_compress(
        &state.settings.text_types,
        record.header.get("Content-Type").unwrap_or(""),
    );

    // レコードのヘッダーをレスポンスへ反映（ステージが設定済みのものが優先）
    let record_headers: Vec<(String, String)> = record
        .header
        .iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect();
    for (name, value) in record_headers {
        if !ctx.out.headers.contains(&name) {
            ctx.out.headers.append(&name, &value);
        }
    }

    if ctx.status == Status::Cacheable {
        let age = crate::cache::response::now_unix().saturating_sub(ctx.resp.created_at);
        let mut num_buf = itoa::Buffer::new();
        ctx.out.headers.set("Age", num_buf.format(age));
    }

    // passとcacheable以外は保存判断をバックグラウンドへ
    if ctx.status != Status::Cacheable && ctx.status != Status::Pass {
        let client = state.client.clone();
        let key = ctx.identity.clone();
        let record = ctx.resp.clone();
        let status = ctx.status;
        let hit_for_pass_ttl = state.settings.hit_for_pass_ttl;
        monoio::spawn(async move {
            store_decision(&client, &key, record, status, compressible, hit_for_pass_ttl);
        });
    }

    if ctx.fresh {
        ctx.out.status_code = 304;
        ctx.out.body.clear();
        return Ok(());
    }

    // 圧縮対象外のデータはクライアントが圧縮を受け付けないものとして扱う
    let accept_encoding = if compressible {
        ctx.req.headers.get("Accept-Encoding").unwrap_or("")
    } else {
        ""
    };
    let (body, encoding) = ctx.resp.get_body(accept_encoding);
    if !encoding.is_empty() {
        ctx.out.headers.set("Content-Encoding", encoding);
    }
    ctx.out.status_code = ctx.resp.status_code;
    ctx.out.body = body;
    Ok(())
}
