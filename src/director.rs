//! Director（backendグループ）
//!
//! 等価なbackend originの名前付きグループです。ホスト・URIプレフィックス
//! によるマッチング、選択ポリシーによるbackend選択、URL書き換え、
//! ヘルスチェックによる可用backendリストの維持を担います。
//!
//! directorは起動時に設定から生成されて優先度順にソートされ、以後は
//! 自身のヘルスチェックタスクだけがAvailableBackendsを書き換えます。

use crate::cache::headers::Headers;
use crate::error::{Error, Result};
use crate::upstream::{self, UpstreamUrl};
use crate::util::{get_cookie_value, parse_header_list};
use ftlog::{error, info};
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// ヘルスチェックの間隔
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// 1回のprobeのタイムアウト
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// backendごとの同時probe数
const PROBE_COUNT: usize = 5;
/// healthyと判定する最低成功数
const PROBE_SUCCESS_THRESHOLD: usize = 3;
/// デフォルトのpingパス
const DEFAULT_PING_PATH: &str = "/ping";

/// backend選択ポリシー
///
/// 設定読み込み時にパースし、未知のポリシーはその場で拒否します。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    First,
    Random,
    RoundRobin,
    IpHash,
    UriHash,
    /// 指定ヘッダー値のハッシュ
    Header(String),
    /// 指定Cookie値のハッシュ
    Cookie(String),
}

impl Policy {
    /// ポリシー文字列をパース
    ///
    /// 空文字列はroundRobinとして扱います。
    pub fn parse(s: &str) -> Result<Policy> {
        match s {
            "" | "roundRobin" => Ok(Policy::RoundRobin),
            "first" => Ok(Policy::First),
            "random" => Ok(Policy::Random),
            "ipHash" => Ok(Policy::IpHash),
            "uriHash" => Ok(Policy::UriHash),
            _ => {
                if let Some(name) = s.strip_prefix("header:") {
                    Ok(Policy::Header(name.to_string()))
                } else if let Some(name) = s.strip_prefix("cookie:") {
                    Ok(Policy::Cookie(name.to_string()))
                } else {
                    Err(Error::NotSupportPolicy(s.to_string()))
                }
            }
        }
    }
}

/// FNV-1a 32bitハッシュ
///
/// backend選択の結果はワイヤ上の挙動として観測されるため、
/// アルゴリズムを固定しています。
fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &b in data {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// directorのロックで保護される可変状態
struct DirectorState {
    available_backends: Vec<String>,
    hosts: Vec<Regex>,
    prefixs: Vec<String>,
    rewrites: Vec<(Regex, String)>,
}

/// backendグループ
pub struct Director {
    pub name: String,
    pub policy: Policy,
    pub ping: String,
    pub backends: Vec<String>,
    /// リクエストに注入するヘッダー
    pub request_header: Vec<(String, String)>,
    /// レスポンスに注入するヘッダー
    pub header: Vec<(String, String)>,
    state: RwLock<DirectorState>,
    /// backend文字列 → パース済みURL
    target_urls: HashMap<String, UpstreamUrl>,
    priority: AtomicI32,
    roubin: AtomicU32,
}

impl Director {
    /// 設定からdirectorを構築
    ///
    /// ホスト正規表現・rewrite・backend URLはここで一度だけ
    /// コンパイル/パースし、不正があれば起動を失敗させます。
    pub fn new(
        name: &str,
        policy: Policy,
        ping: &str,
        backends: &[String],
        hosts: &[String],
        prefixs: &[String],
        rewrites: &[String],
        request_header: &[String],
        header: &[String],
    ) -> Result<Director> {
        let host_regexps = hosts
            .iter()
            .map(|h| {
                Regex::new(h).map_err(|e| Error::Config(format!("invalid host pattern {}: {}", h, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let rewrite_regexps = compile_rewrites(rewrites)?;

        let mut target_urls = HashMap::with_capacity(backends.len());
        for backend in backends {
            target_urls.insert(backend.clone(), UpstreamUrl::parse(backend)?);
        }

        let director = Director {
            name: name.to_string(),
            policy,
            ping: if ping.is_empty() {
                DEFAULT_PING_PATH.to_string()
            } else {
                ping.to_string()
            },
            backends: backends.to_vec(),
            request_header: parse_header_list(request_header),
            header: parse_header_list(header),
            state: RwLock::new(DirectorState {
                available_backends: Vec::new(),
                hosts: host_regexps,
                prefixs: prefixs.to_vec(),
                rewrites: rewrite_regexps,
            }),
            target_urls,
            priority: AtomicI32::new(8),
            roubin: AtomicU32::new(0),
        };
        director.refresh_priority();
        Ok(director)
    }

    /// 優先度を再計算
    ///
    /// 基準は8。ホスト設定があれば-4、プレフィックス設定があれば-2。
    /// 小さいほど優先されます。
    pub fn refresh_priority(&self) {
        let state = self.state.read().unwrap();
        let mut priority = 8;
        if !state.hosts.is_empty() {
            priority -= 4;
        }
        if !state.prefixs.is_empty() {
            priority -= 2;
        }
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// リクエストがこのdirectorにマッチするか
    ///
    /// ホストもプレフィックスも未設定なら全リクエストにマッチ。
    /// 両方設定されている場合は両方を満たす必要があります。
    pub fn is_match(&self, host: &str, uri: &str) -> bool {
        let state = self.state.read().unwrap();
        if state.hosts.is_empty() && state.prefixs.is_empty() {
            return true;
        }
        if !state.hosts.is_empty() {
            let host_matched = state.hosts.iter().any(|re| re.is_match(host));
            if !host_matched {
                return false;
            }
            if state.prefixs.is_empty() {
                return true;
            }
        }
        state.prefixs.iter().any(|prefix| uri.starts_with(prefix))
    }

    /// rewriteルールを適用したURIを返す
    pub fn rewrite(&self, uri: &str) -> String {
        let state = self.state.read().unwrap();
        for (re, replacement) in &state.rewrites {
            if re.is_match(uri) {
                return re.replace_all(uri, replacement.as_str()).into_owned();
            }
        }
        uri.to_string()
    }

    /// 可用backendを追加（ヘルスチェック専用）
    pub fn add_available_backend(&self, backend: &str) {
        let mut state = self.state.write().unwrap();
        if !state.available_backends.iter().any(|b| b == backend) {
            state.available_backends.push(backend.to_string());
        }
    }

    /// 可用backendを削除（ヘルスチェック専用）
    pub fn remove_available_backend(&self, backend: &str) {
        let mut state = self.state.write().unwrap();
        state.available_backends.retain(|b| b != backend);
    }

    pub fn get_available_backends(&self) -> Vec<String> {
        self.state.read().unwrap().available_backends.clone()
    }

    /// ポリシーに従ってbackendを1つ選択
    ///
    /// 可用backendが空の場合はNoneを返し、パイプラインが
    /// upstream不可エラーとして扱います。
    pub fn select(&self, client_ip: &str, uri: &str, headers: &Headers) -> Option<String> {
        let state = self.state.read().unwrap();
        let pool = &state.available_backends;
        let count = pool.len() as u32;
        if count == 0 {
            return None;
        }
        let index = match &self.policy {
            Policy::First => 0,
            Policy::Random => rand::thread_rng().gen::<u32>(),
            Policy::RoundRobin => self.roubin.fetch_add(1, Ordering::Relaxed) + 1,
            Policy::IpHash => fnv1a(client_ip.as_bytes()),
            Policy::UriHash => fnv1a(uri.as_bytes()),
            Policy::Header(name) => fnv1a(headers.get(name).unwrap_or("").as_bytes()),
            Policy::Cookie(name) => {
                fnv1a(get_cookie_value(headers, name).unwrap_or("").as_bytes())
            }
        };
        Some(pool[(index % count) as usize].clone())
    }

    /// backend文字列に対応するパース済みURLを取得
    pub fn get_target_url(&self, backend: &str) -> Result<&UpstreamUrl> {
        if self.target_urls.is_empty() {
            return Err(Error::TargetUrlNotInit);
        }
        self.target_urls
            .get(backend)
            .ok_or_else(|| Error::ParseBackendUrlFail(backend.to_string()))
    }

    /// 全backendに対して1周分のヘルスチェックを実行
    ///
    /// backendごとに5並行のGETを発行し、3回以上ステータスが
    /// [200, 400)ならhealthyとします。
    pub async fn health_check(&self) {
        for backend in &self.backends {
            let target = match self.target_urls.get(backend) {
                Some(target) => target,
                None => continue,
            };
            let healthy = do_check(target, &self.ping).await;
            let was_available = self
                .get_available_backends()
                .iter()
                .any(|b| b == backend);
            if healthy {
                if !was_available {
                    info!("director {} backend {} is healthy", self.name, backend);
                }
                self.add_available_backend(backend);
            } else {
                if was_available {
                    error!("director {} backend {} is unhealthy", self.name, backend);
                }
                self.remove_available_backend(backend);
            }
        }
    }

    #[cfg(test)]
    pub fn set_available_backends(&self, backends: &[&str]) {
        let mut state = self.state.write().unwrap();
        state.available_backends = backends.iter().map(|b| b.to_string()).collect();
    }
}

/// 5回probeして3回以上成功ならhealthy
async fn do_check(target: &UpstreamUrl, ping: &str) -> bool {
    let mut handles = Vec::with_capacity(PROBE_COUNT);
    for _ in 0..PROBE_COUNT {
        let target = target.clone();
        let ping = ping.to_string();
        handles.push(monoio::spawn(async move {
            match upstream::probe(&target, &ping, PROBE_TIMEOUT).await {
                Some(code) => (200..400).contains(&code),
                None => false,
            }
        }));
    }
    let mut success = 0;
    for handle in handles {
        if handle.await {
            success += 1;
        }
    }
    success >= PROBE_SUCCESS_THRESHOLD
}

/// ヘルスチェックループ
///
/// 5秒間隔で全backendを検査し続けます。サイクル中のエラーは
/// 1秒待って再開します。
pub async fn run_health_check_loop(
    director: Arc<Director>,
    shutdown: &std::sync::atomic::AtomicBool,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        director.health_check().await;
        monoio::time::sleep(HEALTH_CHECK_INTERVAL).await;
    }
}

/// rewriteルールのコンパイル
///
/// `pattern:replacement` 形式で、pattern中の `*` は
/// キャプチャグループ `(\S*)` に展開されます。
fn compile_rewrites(rewrites: &[String]) -> Result<Vec<(Regex, String)>> {
    let mut compiled = Vec::with_capacity(rewrites.len());
    for rule in rewrites {
        let (pattern, replacement) = match rule.split_once(':') {
            Some(parts) => parts,
            None => continue,
        };
        let pattern = pattern.replace('*', "(\\S*)");
        let re = Regex::new(&pattern)
            .map_err(|e| Error::Config(format!("invalid rewrite {}: {}", rule, e)))?;
        compiled.push((re, replacement.to_string()));
    }
    Ok(compiled)
}

/// 優先度の昇順でdirectorをソート
pub fn sort_directors(directors: &mut [Arc<Director>]) {
    directors.sort_by_key(|d| d.priority());
}

/// リクエストにマッチする最初のdirectorを返す
pub fn pick_director<'a>(
    directors: &'a [Arc<Director>],
    host: &str,
    uri: &str,
) -> Option<&'a Arc<Director>> {
    directors.iter().find(|d| d.is_match(host, uri))
}
