//! 管理API
//!
//! プレフィックス配下にJSON APIを提供します。すべてのエンドポイントは
//! X-Admin-Tokenヘッダーによるトークン認証を要求し、キャッシュの
//! パイプラインには入りません。
//!
//! - `GET  <prefix>/stats`     : ステータス別エントリ数とストアサイズ
//! - `GET  <prefix>/cacheds`   : cacheableエントリの一覧
//! - `GET  <prefix>/fetchings` : fetching中エントリの一覧
//! - `DELETE <prefix>/cacheds/<key>` : エントリのパージ（keyはURLエンコード）

use super::{error_response, AppState, ResponseOut};
use crate::cache::headers::Headers;
use crate::error::Error;
use crate::server::RequestMeta;
use serde::Serialize;
use std::sync::Arc;

fn json_response<T: Serialize>(value: &T) -> ResponseOut {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut out = ResponseOut {
        status_code: 200,
        headers: Headers::new(),
        body,
    };
    out.headers.set("Content-Type", "application/json; charset=utf-8");
    out.headers.set("Cache-Control", "no-cache");
    out
}

fn not_found() -> ResponseOut {
    let mut out = ResponseOut {
        status_code: 404,
        headers: Headers::new(),
        body: b"not found".to_vec(),
    };
    out.headers.set("Content-Type", "text/plain; charset=utf-8");
    out
}

/// パーセントエンコードされたキーを復元
fn percent_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(hex) = bytes.get(i + 1..i + 3) {
                if let Ok(value) = u8::from_str_radix(std::str::from_utf8(hex).unwrap_or(""), 16) {
                    out.push(value);
                    i += 3;
                    continue;
                }
            }
        }
        if bytes[i] == b'+' {
            out.push(b' ');
        } else {
            out.push(bytes[i]);
        }
        i += 1;
    }
    out
}

pub fn handle(state: &Arc<AppState>, req: &RequestMeta) -> ResponseOut {
    if state.settings.admin_token.is_empty()
        || req.headers.get("X-Admin-Token") != Some(state.settings.admin_token.as_str())
    {
        return error_response(&Error::AccessForbidden);
    }

    let sub_path = &req.path[state.settings.admin_path.len()..];
    match (req.method.as_str(), sub_path) {
        ("GET", "/stats") => json_response(&state.client.stats()),
        ("GET", "/cacheds") => json_response(&state.client.get_cached_list()),
        ("GET", "/fetchings") => json_response(&state.client.get_fetching_list()),
        ("DELETE", _) => {
            if let Some(encoded) = sub_path.strip_prefix("/cacheds/") {
                let key = percent_decode(encoded);
                match state.client.remove(&key) {
                    Ok(()) => ResponseOut {
                        status_code: 204,
                        headers: Headers::new(),
                        body: Vec::new(),
                    },
                    Err(err) => error_response(&err),
                }
            } else {
                not_found()
            }
        }
        _ => not_found(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheClient;
    use crate::config::Config;
    use crate::identity::Identity;
    use crate::middleware::Settings;
    use std::sync::atomic::{AtomicBool, AtomicI32};
    use tempfile::tempdir;

    fn test_state(dir: &tempfile::TempDir) -> Arc<AppState> {
        let config = Config::parse("adminPath: /admin\nadminToken: secret\n").unwrap();
        Arc::new(AppState {
            settings: Settings::from_config(&config).unwrap(),
            identity: Identity::parse("").unwrap(),
            client: Arc::new(CacheClient::open(&dir.path().join("db")).unwrap()),
            directors: Vec::new(),
            inflight: AtomicI32::new(0),
            ping_disabled: AtomicBool::new(false),
        })
    }

    fn admin_request(method: &str, path: &str, token: Option<&str>) -> RequestMeta {
        let mut headers = Headers::new();
        if let Some(token) = token {
            headers.set("X-Admin-Token", token);
        }
        RequestMeta {
            method: method.to_string(),
            host: "localhost".to_string(),
            path: path.to_string(),
            query: String::new(),
            uri: path.to_string(),
            proto: "HTTP/1.1".to_string(),
            client_ip: "127.0.0.1".to_string(),
            headers,
            body: Vec::new(),
        }
    }

    #[test]
    fn test_requires_token() {
        let dir = tempdir().unwrap();
        let state = test_state(&dir);
        let out = handle(&state, &admin_request("GET", "/admin/stats", None));
        assert_eq!(out.status_code, 401);
        let out = handle(&state, &admin_request("GET", "/admin/stats", Some("wrong")));
        assert_eq!(out.status_code, 401);
    }

    #[test]
    fn test_stats_endpoint() {
        let dir = tempdir().unwrap();
        let state = test_state(&dir);
        let out = handle(&state, &admin_request("GET", "/admin/stats", Some("secret")));
        assert_eq!(out.status_code, 200);
        let body = String::from_utf8(out.body).unwrap();
        assert!(body.contains("\"fetching\""));
        assert!(body.contains("\"hitForPass\""));
    }

    #[test]
    fn test_lists_and_purge() {
        let dir = tempdir().unwrap();
        let state = test_state(&dir);
        let key = b"GET h /a";
        state.client.get_request_status(key);
        state.client.cacheable(key, 60);

        let out = handle(&state, &admin_request("GET", "/admin/cacheds", Some("secret")));
        assert!(String::from_utf8(out.body).unwrap().contains("GET h /a"));

        // キーはURLエンコードされて届く
        let out = handle(
            &state,
            &admin_request("DELETE", "/admin/cacheds/GET%20h%20%2Fa", Some("secret")),
        );
        assert_eq!(out.status_code, 204);

        let out = handle(&state, &admin_request("GET", "/admin/cacheds", Some("secret")));
        assert!(!String::from_utf8(out.body).unwrap().contains("GET h /a"));
    }

    #[test]
    fn test_unknown_path() {
        let dir = tempdir().unwrap();
        let state = test_state(&dir);
        let out = handle(&state, &admin_request("GET", "/admin/unknown", Some("secret")));
        assert_eq!(out.status_code, 404);
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("GET%20h%20%2Fa"), b"GET h /a");
        assert_eq!(percent_decode("plain"), b"plain");
        assert_eq!(percent_decode("a+b"), b"a b");
        // 不正なエンコードはそのまま
        assert_eq!(percent_decode("%zz"), b"%zz");
    }
}
