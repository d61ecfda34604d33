//! E2Eテスト
//!
//! kuraバイナリを一時設定で起動し、スクリプト化したbackendに対して
//! キャッシュ・合流・ネゴシエーションの動作を外形から検証します。

mod common;

use common::*;
use std::io::Write as _;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

/// テスト用に起動したkuraプロセス
struct KuraServer {
    child: Child,
    pub port: u16,
    _dir: tempfile::TempDir,
}

impl KuraServer {
    /// 設定を書き出してバイナリを起動し、pingが通るまで待つ
    fn start(directors_yaml: &str, extra_yaml: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let port = get_available_port();
        let config = format!(
            "listen: \"127.0.0.1:{}\"\ndb: {}\n{}\ndirectors:\n{}\n",
            port,
            dir.path().join("db").display(),
            extra_yaml,
            directors_yaml,
        );
        let config_path = dir.path().join("config.yml");
        std::fs::write(&config_path, config).unwrap();

        let child = Command::new(env!("CARGO_BIN_EXE_kura"))
            .arg("-c")
            .arg(&config_path)
            .env("KURA_ENV", "dev")
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .expect("spawn kura");

        assert!(
            wait_for_port(port, Duration::from_secs(10)),
            "kura did not start listening"
        );
        let server = Self {
            child,
            port,
            _dir: dir,
        };
        server.wait_until_ready();
        server
    }

    fn wait_until_ready(&self) {
        for _ in 0..100 {
            if let Ok(resp) = http_request(self.port, "GET", "/ping", &[]) {
                if resp.status == 200 {
                    // ヘルスチェックの初回サイクルがbackendを登録するまで待つ
                    thread::sleep(Duration::from_millis(600));
                    return;
                }
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("kura did not become ready");
    }
}

impl Drop for KuraServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn single_backend_yaml(backend: &ScriptedBackend) -> String {
    format!(
        "  - name: test\n    policy: roundRobin\n    backends: [\"{}\"]",
        backend.url()
    )
}

#[test]
fn test_ping() {
    let backend = ScriptedBackend::start(BackendResponse::text(200, b"hello"));
    let server = KuraServer::start(&single_backend_yaml(&backend), "");
    let resp = http_request(server.port, "GET", "/ping", &[]).unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"pong");
}

#[test]
fn test_cold_cache_single_get() {
    let backend = ScriptedBackend::start(
        BackendResponse::text(200, b"cacheable body").header("Cache-Control", "max-age=60"),
    );
    let server = KuraServer::start(&single_backend_yaml(&backend), "");

    let resp = http_request(server.port, "GET", "/a", &[]).unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("X-Cache"), Some("miss"));
    assert_eq!(resp.header("X-Status"), Some("fetching"));
    assert_eq!(resp.body, b"cacheable body");

    // 保存はバックグラウンドなので少し待つ
    thread::sleep(Duration::from_millis(300));

    let resp = http_request(server.port, "GET", "/a", &[]).unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("X-Cache"), Some("hit"));
    assert_eq!(resp.header("X-Status"), Some("cacheable"));
    assert!(resp.header("Age").is_some());
    assert_eq!(resp.body, b"cacheable body");

    assert_eq!(backend.hit_count(), 1, "only one origin fetch expected");
}

#[test]
fn test_concurrent_gets_coalesce() {
    let backend = ScriptedBackend::start(
        BackendResponse::text(200, b"slow body")
            .header("Cache-Control", "max-age=60")
            .delay(Duration::from_millis(500)),
    );
    let server = KuraServer::start(&single_backend_yaml(&backend), "");
    let port = server.port;

    let first = thread::spawn(move || http_request(port, "GET", "/slow", &[]).unwrap());
    thread::sleep(Duration::from_millis(100));
    let second = thread::spawn(move || http_request(port, "GET", "/slow", &[]).unwrap());

    let resp1 = first.join().unwrap();
    let resp2 = second.join().unwrap();

    assert_eq!(resp1.status, 200);
    assert_eq!(resp2.status, 200);
    assert_eq!(resp1.body, b"slow body");
    assert_eq!(resp2.body, b"slow body");

    let mut statuses = vec![
        resp1.header("X-Status").unwrap().to_string(),
        resp2.header("X-Status").unwrap().to_string(),
    ];
    statuses.sort();
    assert_eq!(statuses, vec!["fetching", "waiting"]);

    assert_eq!(backend.hit_count(), 1, "origin fetch must be coalesced");
}

#[test]
fn test_origin_500_becomes_hit_for_pass() {
    let backend = ScriptedBackend::start(BackendResponse::text(500, b"origin error"));
    let server = KuraServer::start(&single_backend_yaml(&backend), "");

    let resp = http_request(server.port, "GET", "/err", &[]).unwrap();
    assert_eq!(resp.status, 500);
    thread::sleep(Duration::from_millis(300));

    // TTLなしレスポンスのキーはhit for passになり、毎回素通しされる
    let resp = http_request(server.port, "GET", "/err", &[]).unwrap();
    assert_eq!(resp.status, 500);
    assert_eq!(resp.header("X-Cache"), Some("miss"));
    assert_eq!(resp.header("X-Status"), Some("hitForPass"));
    assert_eq!(backend.hit_count(), 2);
}

#[test]
fn test_brotli_client_with_gzip_only_record() {
    // 小さい生データはsave時に再圧縮されず、gzipバッファだけが残る
    let raw = b"small gzipped payload";
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(raw).unwrap();
    let gzipped = encoder.finish().unwrap();

    let backend = ScriptedBackend::start(
        BackendResponse {
            status: 200,
            headers: vec![
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Content-Encoding".to_string(), "gzip".to_string()),
                ("Cache-Control".to_string(), "max-age=60".to_string()),
            ],
            body: gzipped,
            delay: Duration::ZERO,
        },
    );
    let server = KuraServer::start(&single_backend_yaml(&backend), "");

    let resp = http_request(server.port, "GET", "/gz", &[]).unwrap();
    assert_eq!(resp.status, 200);
    thread::sleep(Duration::from_millis(300));

    // brを受け付けるクライアントにはgzipから再エンコードしたbrを返す
    let resp = http_request(
        server.port,
        "GET",
        "/gz",
        &[("Accept-Encoding", "br, gzip")],
    )
    .unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("X-Cache"), Some("hit"));
    assert_eq!(resp.header("Content-Encoding"), Some("br"));
    let mut decoded = Vec::new();
    brotli::BrotliDecompress(&mut &resp.body[..], &mut decoded).unwrap();
    assert_eq!(decoded, raw);
}

#[test]
fn test_gzip_client_gets_precompressed_buffer() {
    let body = vec![b'a'; 4096];
    let backend = ScriptedBackend::start(
        BackendResponse::text(200, &body).header("Cache-Control", "max-age=60"),
    );
    let server = KuraServer::start(&single_backend_yaml(&backend), "");

    let resp = http_request(server.port, "GET", "/big", &[]).unwrap();
    assert_eq!(resp.status, 200);
    thread::sleep(Duration::from_millis(300));

    let resp = http_request(
        server.port,
        "GET",
        "/big",
        &[("Accept-Encoding", "gzip")],
    )
    .unwrap();
    assert_eq!(resp.header("Content-Encoding"), Some("gzip"));
    let mut decoder = flate2::read::GzDecoder::new(&resp.body[..]);
    let mut decoded = Vec::new();
    std::io::Read::read_to_end(&mut decoder, &mut decoded).unwrap();
    assert_eq!(decoded, body);

    // エンコーディングなしのクライアントには生データを返す
    let resp = http_request(server.port, "GET", "/big", &[]).unwrap();
    assert_eq!(resp.header("Content-Encoding"), None);
    assert_eq!(resp.body, body);
}

#[test]
fn test_post_is_pass() {
    let backend = ScriptedBackend::start(
        BackendResponse::text(200, b"posted").header("Cache-Control", "max-age=60"),
    );
    let server = KuraServer::start(&single_backend_yaml(&backend), "");

    for _ in 0..2 {
        let resp = http_request(server.port, "POST", "/form", &[]).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("X-Status"), Some("pass"));
        assert_eq!(resp.header("X-Cache"), Some("miss"));
    }
    // passはキャッシュも合流もされない
    assert_eq!(backend.hit_count(), 2);
}

#[test]
fn test_round_robin_across_backends() {
    let x = ScriptedBackend::start(BackendResponse::text(200, b"from-x"));
    let y = ScriptedBackend::start(BackendResponse::text(200, b"from-y"));
    let z = ScriptedBackend::start(BackendResponse::text(200, b"from-z"));
    let directors = format!(
        "  - name: rr\n    policy: roundRobin\n    backends: [\"{}\", \"{}\", \"{}\"]",
        x.url(),
        y.url(),
        z.url()
    );
    let server = KuraServer::start(&directors, "");
    // 全backendが可用になるまで余裕を持って待つ
    thread::sleep(Duration::from_millis(600));

    // POSTはpassなのでキャッシュに吸われずカウンタが順に進む
    let bodies: Vec<String> = (0..3)
        .map(|_| {
            let resp = http_request(server.port, "POST", "/which", &[]).unwrap();
            String::from_utf8(resp.body).unwrap()
        })
        .collect();
    assert_eq!(bodies, vec!["from-y", "from-z", "from-x"]);
}

#[test]
fn test_director_unavailable() {
    // どのdirectorにもマッチしないホスト
    let backend = ScriptedBackend::start(BackendResponse::text(200, b"x"));
    let directors = format!(
        "  - name: hosted\n    backends: [\"{}\"]\n    hosts: [\"only\\\\.this\\\\.host\"]",
        backend.url()
    );
    let server = KuraServer::start(&directors, "");
    let resp = http_request(server.port, "GET", "/a", &[]).unwrap();
    assert_eq!(resp.status, 503);
}

#[test]
fn test_admin_endpoints() {
    let backend = ScriptedBackend::start(
        BackendResponse::text(200, b"admin test").header("Cache-Control", "max-age=60"),
    );
    let server = KuraServer::start(
        &single_backend_yaml(&backend),
        "adminPath: /admin\nadminToken: secret",
    );

    // トークンなしは401
    let resp = http_request(server.port, "GET", "/admin/stats", &[]).unwrap();
    assert_eq!(resp.status, 401);

    // キャッシュを作ってから統計を見る
    http_request(server.port, "GET", "/cached", &[]).unwrap();
    thread::sleep(Duration::from_millis(300));

    let resp = http_request(
        server.port,
        "GET",
        "/admin/stats",
        &[("X-Admin-Token", "secret")],
    )
    .unwrap();
    assert_eq!(resp.status, 200);
    let body = String::from_utf8(resp.body).unwrap();
    assert!(body.contains("\"cacheable\":1"), "stats: {}", body);

    let resp = http_request(
        server.port,
        "GET",
        "/admin/cacheds",
        &[("X-Admin-Token", "secret")],
    )
    .unwrap();
    let body = String::from_utf8(resp.body).unwrap();
    assert!(body.contains("/cached"), "cacheds: {}", body);
}

#[test]
fn test_server_timing_header() {
    let backend = ScriptedBackend::start(BackendResponse::text(200, b"timed"));
    let server = KuraServer::start(&single_backend_yaml(&backend), "enableServerTiming: true");
    let resp = http_request(server.port, "GET", "/t", &[]).unwrap();
    let timing = resp.header("Server-Timing").unwrap();
    assert!(timing.starts_with("0="), "timing: {}", timing);
    assert!(timing.contains(";kura"));
}

#[test]
fn test_etag_and_not_modified() {
    let backend = ScriptedBackend::start(
        BackendResponse::text(200, b"versioned").header("Cache-Control", "max-age=60"),
    );
    let server = KuraServer::start(&single_backend_yaml(&backend), "eTag: true");

    let resp = http_request(server.port, "GET", "/v", &[]).unwrap();
    assert_eq!(resp.status, 200);
    let etag = resp.header("ETag").expect("etag generated").to_string();
    assert!(etag.starts_with("W/"));
    thread::sleep(Duration::from_millis(300));

    let resp = http_request(server.port, "GET", "/v", &[("If-None-Match", &etag)]).unwrap();
    assert_eq!(resp.status, 304);
    assert!(resp.body.is_empty());
}
