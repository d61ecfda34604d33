//! kura - キャッシュ機能付きHTTPリバースプロキシ
//!
//! リクエストキーごとのステータステーブルでorigin fetchを合流させ、
//! レスポンスをsledへ永続化し、gzip/brotliのコンテンツネゴシエーション
//! 付きで配信します。ワーカーはスレッドごとのmonoioランタイムで動作し、
//! SO_REUSEPORTでlistenを共有します。

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod cache;
mod config;
mod director;
mod error;
mod identity;
mod middleware;
mod server;
mod upstream;
mod util;

use cache::CacheClient;
use clap::Parser;
use config::Config;
use director::Director;
use ftlog::{error, info, LevelFilter};
use middleware::{AppState, Settings};
use monoio::RuntimeBuilder;
use std::io::{Read, Write};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

/// Graceful Shutdownフラグ
static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

/// シャットダウン中かどうか
pub fn is_shutting_down() -> bool {
    SHUTDOWN_FLAG.load(Ordering::Relaxed)
}

/// シャットダウン時のドレイン待機時間
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "kura")]
#[command(version, about = "キャッシュ機能付きHTTPリバースプロキシ")]
struct Cli {
    /// 設定ファイルのパス
    #[arg(short = 'c', long = "config", default_value = "./config.yml")]
    config: String,

    /// サブコマンド: version | test | check
    command: Option<String>,
}

/// LVL環境変数からログレベルを決める
fn log_level_from_env() -> LevelFilter {
    match std::env::var("LVL").ok().and_then(|v| v.parse::<u8>().ok()) {
        Some(0 | 1) => LevelFilter::Error,
        Some(2) => LevelFilter::Warn,
        Some(3) => LevelFilter::Info,
        Some(4) => LevelFilter::Debug,
        Some(5) => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// `/ping`へのGETで稼働確認し、プロセスの終了コードを返す
fn check(config: &Config) -> i32 {
    let addr = if config.listen.starts_with(':') {
        format!("127.0.0.1{}", config.listen)
    } else {
        config.listen.clone()
    };
    let parsed_addr = match addr.parse() {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!("health check fail: invalid listen address {}", addr);
            return 1;
        }
    };
    let mut stream =
        match std::net::TcpStream::connect_timeout(&parsed_addr, Duration::from_secs(3)) {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("health check fail: {}", e);
                return 1;
            }
        };
    let _ = stream.set_read_timeout(Some(Duration::from_secs(3)));
    let request = b"GET /ping HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n";
    if let Err(e) = stream.write_all(request) {
        eprintln!("health check fail: {}", e);
        return 1;
    }
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response);
    let mut headers_storage = [httparse::EMPTY_HEADER; 16];
    let mut parsed = httparse::Response::new(&mut headers_storage);
    match parsed.parse(&response) {
        Ok(_) => match parsed.code {
            Some(code) if (200..400).contains(&code) => 0,
            Some(code) => {
                eprintln!("health check fail, status: {}", code);
                1
            }
            None => {
                eprintln!("health check fail: no status");
                1
            }
        },
        Err(e) => {
            eprintln!("health check fail: {}", e);
            1
        }
    }
}

/// directorごとのヘルスチェックスレッドを起動
///
/// サイクル内でpanicした場合は1秒待って再開します。
fn spawn_health_check(director: Arc<Director>) {
    thread::Builder::new()
        .name(format!("health-{}", director.name))
        .spawn(move || loop {
            if is_shutting_down() {
                return;
            }
            let director_for_run = director.clone();
            let result = std::panic::catch_unwind(AssertUnwindSafe(move || {
                let mut rt = RuntimeBuilder::<monoio::FusionDriver>::new()
                    .enable_timer()
                    .build()
                    .expect("build health check runtime");
                rt.block_on(director::run_health_check_loop(
                    director_for_run,
                    &SHUTDOWN_FLAG,
                ));
            }));
            if is_shutting_down() {
                return;
            }
            if result.is_err() {
                error!("health check for {} failed, restarting", director.name);
                thread::sleep(Duration::from_secs(1));
            }
        })
        .expect("spawn health check thread");
}

/// 期限切れエントリを定期的に掃除するスレッドを起動
fn spawn_expired_clear(client: Arc<CacheClient>, interval: Duration) {
    let interval = if interval.is_zero() {
        Duration::from_secs(300)
    } else {
        interval
    };
    thread::Builder::new()
        .name("expired-clear".to_string())
        .spawn(move || loop {
            thread::sleep(interval);
            if is_shutting_down() {
                return;
            }
            client.clear_expired(cache::client::DEFAULT_CLEAR_DELAY);
        })
        .expect("spawn expired clear thread");
}

/// directorリストを構築して優先度順にソート
fn build_directors(config: &Config) -> error::Result<Vec<Arc<Director>>> {
    let mut directors = Vec::with_capacity(config.directors.len());
    for dc in &config.directors {
        let policy = director::Policy::parse(&dc.policy)?;
        let d = Director::new(
            &dc.name,
            policy,
            &dc.ping,
            &dc.backends,
            &dc.hosts,
            &dc.prefixs,
            &dc.rewrites,
            &dc.request_header,
            &dc.header,
        )?;
        directors.push(Arc::new(d));
    }
    director::sort_directors(&mut directors);
    Ok(directors)
}

fn main() {
    let cli = Cli::parse();

    let _guard = ftlog::Builder::new()
        .max_log_level(log_level_from_env())
        .try_init()
        .expect("init logger");

    if cli.command.as_deref() == Some("version") {
        println!("kura version {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let config = match Config::load(Path::new(&cli.config)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("load config {} fail: {}", cli.config, e);
            std::process::exit(1);
        }
    };

    match cli.command.as_deref() {
        Some("test") => {
            let dumped = serde_json::to_string_pretty(&config).expect("dump config");
            println!("the config file test done, config: {}", dumped);
            return;
        }
        Some("check") => {
            std::process::exit(check(&config));
        }
        Some(other) => {
            eprintln!("unknown command: {}", other);
            std::process::exit(1);
        }
        None => {}
    }

    info!("start kura with config {}", cli.config);

    let settings = match Settings::from_config(&config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("invalid config: {}", e);
            std::process::exit(1);
        }
    };
    let identity = identity::Identity::parse(&config.identity).expect("validated identity");

    let client = match CacheClient::open(Path::new(&config.db)) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("open cache store {} fail: {}", config.db, e);
            std::process::exit(1);
        }
    };

    let directors = match build_directors(&config) {
        Ok(directors) => directors,
        Err(e) => {
            eprintln!("build directors fail: {}", e);
            std::process::exit(1);
        }
    };
    for director in &directors {
        spawn_health_check(director.clone());
    }

    spawn_expired_clear(
        client.clone(),
        Duration::from_secs(config.expired_clear_interval),
    );

    let state = Arc::new(AppState {
        settings,
        identity,
        client: client.clone(),
        directors,
        inflight: AtomicI32::new(0),
        ping_disabled: AtomicBool::new(false),
    });

    let listen_addr = match server::parse_listen_addr(&config.listen) {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    info!("============================================");
    info!("kura caching reverse proxy");
    info!("Listen Address: {}", listen_addr);
    info!("Threads: {}", num_cpus::get());
    info!("Store: {}", config.db);
    info!("Directors: {}", state.directors.len());
    info!("============================================");

    // シグナルでpingを無効化し、ドレイン後に停止する
    let (signal_tx, signal_rx) = mpsc::channel::<()>();
    let signal_state = state.clone();
    ctrlc::set_handler(move || {
        signal_state.ping_disabled.store(true, Ordering::Relaxed);
        let _ = signal_tx.send(());
    })
    .expect("set signal handler");

    let num_threads = num_cpus::get();
    let mut handles = Vec::with_capacity(num_threads);
    for thread_id in 0..num_threads {
        let state = state.clone();
        let handle = thread::Builder::new()
            .name(format!("worker-{}", thread_id))
            .spawn(move || {
                let mut rt = RuntimeBuilder::<monoio::FusionDriver>::new()
                    .enable_timer()
                    .build()
                    .expect("build worker runtime");
                rt.block_on(async move {
                    let listener = match server::create_listener(listen_addr) {
                        Ok(listener) => listener,
                        Err(e) => {
                            error!("[worker {}] bind error: {}", thread_id, e);
                            return;
                        }
                    };
                    server::accept_loop(listener, state, &SHUTDOWN_FLAG, thread_id).await;
                });
            })
            .expect("spawn worker thread");
        handles.push(handle);
    }

    let _ = signal_rx.recv();
    info!("received shutdown signal, draining");
    // pingが失敗するようになったら上流LBが切り離すのを待つ
    if std::env::var("KURA_ENV").as_deref() != Ok("dev") {
        thread::sleep(SHUTDOWN_DRAIN);
    }
    SHUTDOWN_FLAG.store(true, Ordering::SeqCst);

    for handle in handles {
        let _ = handle.join();
    }
    if let Err(e) = client.close() {
        error!("close store fail: {}", e);
    }
    info!("server shutdown complete");
}
