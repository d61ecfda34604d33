//! ミドルウェアパイプライン
//!
//! リクエスト1件を処理する一連のステージです。順序は固定で、
//! ping → admin → logger → recover → initialization → identifier →
//! directorPicker → cacheFetcher → proxy → headerSetter →
//! freshChecker → dispatcher の順に流れます。
//!
//! recover以降のステージはResultで失敗を返し、recover境界が
//! エラー種別に応じたHTTPレスポンスへ変換します。

pub mod admin;
pub mod dispatcher;
pub mod fresh;
pub mod proxy;

use crate::cache::headers::Headers;
use crate::cache::response::Response;
use crate::cache::status::Status;
use crate::cache::CacheClient;
use crate::config::Config;
use crate::director::Director;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::server::RequestMeta;
use crate::util::parse_header_list;
use ftlog::info;
use regex::Regex;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Server-Timing等で使用するサービス名
pub const SERVER_NAME: &str = "kura";

const PING_PATH: &str = "/ping";

/// 設定から導出した実行時パラメータ
pub struct Settings {
    pub compress_level: i32,
    pub compress_min_length: usize,
    pub text_types: Vec<Regex>,
    pub hit_for_pass_ttl: u16,
    pub enable_server_timing: bool,
    pub e_tag: bool,
    pub connect_timeout: Duration,
    pub concurrency: i32,
    pub admin_path: String,
    pub admin_token: String,
    pub access_log: bool,
    pub log_format: String,
    /// 全レスポンスへ注入する静的ヘッダー
    pub header: Vec<(String, String)>,
    /// 全リクエストへ注入する静的ヘッダー
    pub request_header: Vec<(String, String)>,
}

impl Settings {
    pub fn from_config(config: &Config) -> Result<Settings> {
        let text_types = config
            .text_types
            .iter()
            .map(|t| {
                Regex::new(t)
                    .map_err(|e| Error::Config(format!("invalid text type {}: {}", t, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Settings {
            compress_level: config.compress_level,
            compress_min_length: config.compress_min_length,
            text_types,
            hit_for_pass_ttl: config.hit_for_pass,
            enable_server_timing: config.enable_server_timing,
            e_tag: config.e_tag,
            connect_timeout: Duration::from_secs(config.connect_timeout),
            concurrency: config.concurrency as i32,
            admin_path: config.admin_path.clone(),
            admin_token: config.admin_token.clone(),
            access_log: !config.access_log.is_empty(),
            log_format: config.log_format.clone(),
            header: parse_header_list(&config.header),
            request_header: parse_header_list(&config.request_header),
        })
    }
}

/// プロセス全体で共有される状態
pub struct AppState {
    pub settings: Settings,
    pub identity: Identity,
    pub client: Arc<CacheClient>,
    /// 優先度順にソート済み
    pub directors: Vec<Arc<Director>>,
    pub inflight: AtomicI32,
    pub ping_disabled: AtomicBool,
}

/// クライアントへ書き出すレスポンス
#[derive(Debug, Default)]
pub struct ResponseOut {
    pub status_code: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// 同時実行数カウンタのガード
struct ConcurrencyGuard {
    state: Arc<AppState>,
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        self.state.inflight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// リクエスト1件分のコンテキスト
pub struct Context {
    pub req: RequestMeta,
    /// 制御用ステータス（waiterは起床時に受信値で上書き）
    pub status: Status,
    /// identifier時点で観測したステータス（X-Status用）
    pub observed: Status,
    /// キャッシュキー。Passリクエストでは空
    pub identity: Vec<u8>,
    pub director: Option<Arc<Director>>,
    /// 構築中または読み出したキャッシュレコード
    pub resp: Response,
    /// クライアントのキャッシュが最新かどうか
    pub fresh: bool,
    pub out: ResponseOut,
    gate: Option<ConcurrencyGuard>,
}

impl Context {
    fn new(req: RequestMeta) -> Context {
        Context {
            req,
            status: Status::Pass,
            observed: Status::Pass,
            identity: Vec::new(),
            director: None,
            resp: Response::default(),
            fresh: false,
            out: ResponseOut::default(),
            gate: None,
        }
    }
}

/// リクエスト1件を処理してレスポンスを返す
pub async fn handle_request(state: &Arc<AppState>, req: RequestMeta) -> ResponseOut {
    // ping: シャットダウン中はエラーにして上流LBから切り離させる
    if req.path == PING_PATH {
        if state.ping_disabled.load(Ordering::Relaxed) {
            return error_response(&Error::DisableServer);
        }
        let mut out = ResponseOut {
            status_code: 200,
            headers: Headers::new(),
            body: b"pong".to_vec(),
        };
        out.headers.set("Content-Type", "text/plain; charset=utf-8");
        return out;
    }

    // admin: プレフィックス一致でJSON APIへ。キャッシュ経路には入らない
    if !state.settings.admin_path.is_empty() && req.path.starts_with(&state.settings.admin_path) {
        return admin::handle(state, &req);
    }

    let started_at = Instant::now();
    let mut ctx = Context::new(req);

    // recover境界: 以降のステージのエラーをHTTPレスポンスへ変換
    let mut out = match pipeline(state, &mut ctx).await {
        Ok(()) => std::mem::take(&mut ctx.out),
        Err(err) => {
            // fetcherのまま失敗したキーをhit for passにして、
            // waiterが落ちた経路に並び続けないようにする
            if ctx.status == Status::Fetching && !ctx.identity.is_empty() {
                state
                    .client
                    .hit_for_pass(&ctx.identity, state.settings.hit_for_pass_ttl);
            }
            let mut out = error_response(&err);
            out.headers.set("X-Status", ctx.observed.as_str());
            out
        }
    };

    if state.settings.enable_server_timing {
        set_server_timing(&mut out.headers, started_at);
    }
    if state.settings.access_log {
        write_access_log(state, &ctx, &out, started_at);
    }
    out
}

async fn pipeline(state: &Arc<AppState>, ctx: &mut Context) -> Result<()> {
    initialization(state, ctx)?;
    identifier(state, ctx).await?;
    director_picker(state, ctx)?;
    cache_fetcher(state, ctx)?;
    proxy::proxy(state, ctx).await?;
    header_setter(state, ctx)?;
    fresh::fresh_checker(state, ctx)?;
    dispatcher::dispatcher(state, ctx)?;
    Ok(())
}

/// 同時実行数のゲートと静的ヘッダーの注入
fn initialization(state: &Arc<AppState>, ctx: &mut Context) -> Result<()> {
    let current = state.inflight.fetch_add(1, Ordering::Relaxed) + 1;
    ctx.gate = Some(ConcurrencyGuard {
        state: state.clone(),
    });
    if current > state.settings.concurrency {
        return Err(Error::TooManyRequests);
    }
    for (name, value) in &state.settings.request_header {
        ctx.req.headers.set(name, value);
    }
    for (name, value) in &state.settings.header {
        ctx.out.headers.set(name, value);
    }
    Ok(())
}

/// キャッシュキーの算出とステータス取得
///
/// fetching中のキーではwaiterとして待機し、起床時に受け取った
/// 確定後ステータスで制御ステータスを上書きします。
async fn identifier(state: &Arc<AppState>, ctx: &mut Context) -> Result<()> {
    if ctx.req.method != "GET" && ctx.req.method != "HEAD" {
        ctx.status = Status::Pass;
        ctx.observed = Status::Pass;
        return Ok(());
    }
    let key = state.identity.build(&ctx.req);
    let (status, waiter) = state.client.get_request_status(&key);
    ctx.identity = key;
    ctx.observed = status;
    ctx.status = match waiter {
        Some(waiter) => waiter.await,
        None => status,
    };
    Ok(())
}

/// 優先度順の先頭からマッチするdirectorを選択
fn director_picker(state: &Arc<AppState>, ctx: &mut Context) -> Result<()> {
    match crate::director::pick_director(&state.directors, &ctx.req.host, &ctx.req.uri) {
        Some(director) => {
            ctx.director = Some(director.clone());
            Ok(())
        }
        None => Err(Error::DirectorUnavailable),
    }
}

/// cacheableならストアからレコードを読み出す
///
/// ステータステーブルとストアが食い違っていた場合（レコード欠落）は
/// ミスとして扱い、このリクエストに限りFetchingへ降格して続行します。
fn cache_fetcher(state: &Arc<AppState>, ctx: &mut Context) -> Result<()> {
    if ctx.status != Status::Cacheable {
        return Ok(());
    }
    match state.client.get_response(&ctx.identity) {
        Some(resp) => {
            ctx.resp = resp;
        }
        None => {
            ctx.status = Status::Fetching;
        }
    }
    Ok(())
}

/// directorのレスポンスヘッダーとX-Status/X-Cacheを設定
fn header_setter(_state: &Arc<AppState>, ctx: &mut Context) -> Result<()> {
    if let Some(director) = &ctx.director {
        for (name, value) in &director.header {
            ctx.out.headers.set(name, value);
        }
    }
    ctx.out.headers.set("X-Status", ctx.observed.as_str());
    let x_cache = if ctx.status == Status::Cacheable {
        "hit"
    } else {
        "miss"
    };
    ctx.out.headers.set("X-Cache", x_cache);
    Ok(())
}

/// エラーをHTTPレスポンスへ変換
pub fn error_response(err: &Error) -> ResponseOut {
    let mut out = ResponseOut {
        status_code: err.status_code(),
        headers: Headers::new(),
        body: err.to_string().into_bytes(),
    };
    out.headers.set("Content-Type", "text/plain; charset=utf-8");
    out.headers.set("Cache-Control", "no-cache");
    out
}

/// Server-Timingヘッダーを設定
///
/// 既存の値があれば先頭に連結します。
fn set_server_timing(headers: &mut Headers, started_at: Instant) {
    let ms = started_at.elapsed().as_millis();
    let desc = format!("0={};{}", ms, SERVER_NAME);
    let value = match headers.get("Server-Timing") {
        Some(existing) => format!("{},{}", desc, existing),
        None => desc,
    };
    headers.set("Server-Timing", &value);
}

/// アクセスログを1行出力
fn write_access_log(state: &Arc<AppState>, ctx: &Context, out: &ResponseOut, started_at: Instant) {
    let consuming = started_at.elapsed().as_millis();
    let mut num_buf = itoa::Buffer::new();
    let line = state
        .settings
        .log_format
        .replace("{method}", &ctx.req.method)
        .replace("{host}", &ctx.req.host)
        .replace("{uri}", &ctx.req.uri)
        .replace("{status}", num_buf.format(out.status_code))
        .replace("{size}", &out.body.len().to_string())
        .replace("{consuming}", &consuming.to_string())
        .replace("{xStatus}", ctx.observed.as_str());
    info!("{}", line);
}
