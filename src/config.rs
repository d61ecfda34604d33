//! 設定ファイル
//!
//! YAML形式の設定を読み込みます。未指定のキーはフィールドごとの
//! デフォルト値で補われます。ポリシー文字列とidentityフォーマットは
//! ここで検証し、不正ならリクエスト処理に入る前に起動を失敗させます。

use crate::director::Policy;
use crate::error::{Error, Result};
use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_listen() -> String {
    ":3015".to_string()
}
fn default_db() -> String {
    "/tmp/kura".to_string()
}
fn default_expired_clear_interval() -> u64 {
    300
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_concurrency() -> u32 {
    256 * 1024
}
fn default_hit_for_pass() -> u16 {
    300
}
fn default_compress_min_length() -> usize {
    1024
}
fn default_text_types() -> Vec<String> {
    vec![
        "text".to_string(),
        "javascript".to_string(),
        "json".to_string(),
    ]
}
fn default_log_format() -> String {
    "{method} {uri} {status} {size} {consuming}ms".to_string()
}

/// director単位の設定
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct DirectorConfig {
    pub name: String,
    /// backend選択ポリシー。空はroundRobin
    #[serde(default)]
    pub policy: String,
    /// ヘルスチェックのパス。空は/ping
    #[serde(default)]
    pub ping: String,
    pub backends: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub prefixs: Vec<String>,
    #[serde(default)]
    pub rewrites: Vec<String>,
    /// `Name:Value` 形式のリクエストヘッダー設定
    #[serde(default)]
    pub request_header: Vec<String>,
    /// `Name:Value` 形式のレスポンスヘッダー設定
    #[serde(default)]
    pub header: Vec<String>,
}

/// プロキシ全体の設定
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// listenアドレス
    #[serde(default = "default_listen")]
    pub listen: String,
    /// 永続ストアのパス
    #[serde(default = "default_db")]
    pub db: String,
    /// 管理APIのプレフィックス。空なら無効
    #[serde(default)]
    pub admin_path: String,
    /// 管理APIのトークン
    #[serde(default)]
    pub admin_token: String,
    /// 期限切れエントリ掃除の間隔（秒）
    #[serde(default = "default_expired_clear_interval")]
    pub expired_clear_interval: u64,
    /// backend接続タイムアウト（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// 同時処理リクエスト数の上限
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default)]
    pub enable_server_timing: bool,
    /// レスポンスにETagを生成するか
    #[serde(default, rename = "eTag")]
    pub e_tag: bool,
    /// hit for passの有効期間（秒）
    #[serde(default = "default_hit_for_pass")]
    pub hit_for_pass: u16,
    /// 圧縮レベル。0はライブラリデフォルト
    #[serde(default)]
    pub compress_level: i32,
    /// 圧縮対象の最小ボディサイズ
    #[serde(default = "default_compress_min_length")]
    pub compress_min_length: usize,
    /// 圧縮対象のContent-Typeパターン
    #[serde(default = "default_text_types")]
    pub text_types: Vec<String>,
    /// キャッシュキーのフォーマット
    #[serde(default)]
    pub identity: String,
    /// アクセスログ出力先。空なら無効
    #[serde(default)]
    pub access_log: String,
    /// ログ種別（date | normal）。互換のため受理
    #[serde(default)]
    pub log_type: String,
    /// アクセスログのフォーマット
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// 全レスポンスへ注入するヘッダー
    #[serde(default)]
    pub header: Vec<String>,
    /// 全リクエストへ注入するヘッダー
    #[serde(default)]
    pub request_header: Vec<String>,
    #[serde(default)]
    pub directors: Vec<DirectorConfig>,
}

impl Default for Config {
    fn default() -> Self {
        serde_yaml::from_str("{}").unwrap()
    }
}

impl Config {
    /// ファイルから読み込んで検証
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)?;
        Config::parse(&content)
    }

    /// YAML文字列から読み込んで検証
    pub fn parse(content: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// リクエスト処理前に確定できる検証をまとめて行う
    fn validate(&self) -> Result<()> {
        Identity::parse(&self.identity)?;
        for director in &self.directors {
            if director.name.is_empty() {
                return Err(Error::Config("director name is required".to_string()));
            }
            if director.backends.is_empty() {
                return Err(Error::Config(format!(
                    "director {} has no backends",
                    director.name
                )));
            }
            Policy::parse(&director.policy)?;
        }
        if !self.log_type.is_empty() && self.log_type != "date" && self.log_type != "normal" {
            return Err(Error::Config(format!(
                "unknown logType: {}",
                self.log_type
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config.listen, ":3015");
        assert_eq!(config.db, "/tmp/kura");
        assert_eq!(config.expired_clear_interval, 300);
        assert_eq!(config.connect_timeout, 10);
        assert_eq!(config.concurrency, 256 * 1024);
        assert_eq!(config.hit_for_pass, 300);
        assert_eq!(config.compress_level, 0);
        assert_eq!(config.compress_min_length, 1024);
        assert_eq!(config.text_types, vec!["text", "javascript", "json"]);
        assert!(!config.enable_server_timing);
        assert!(!config.e_tag);
        assert!(config.directors.is_empty());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
listen: ":8080"
db: /var/lib/kura
adminPath: /admin
adminToken: secret
expiredClearInterval: 120
connectTimeout: 5
concurrency: 1024
enableServerTiming: true
eTag: true
compressLevel: 6
compressMinLength: 2048
identity: "method host path"
accessLog: console
logType: date
directors:
  - name: aslant
    policy: "cookie:jt"
    ping: /healthz
    backends:
      - http://127.0.0.1:5018
    hosts:
      - (www.)?aslant.site
    prefixs:
      - /api
    rewrites:
      - "/api/*:/$1"
    requestHeader:
      - "X-Via:kura"
    header:
      - "X-Powered-By:kura"
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.listen, ":8080");
        assert_eq!(config.admin_path, "/admin");
        assert!(config.e_tag);
        assert!(config.enable_server_timing);
        assert_eq!(config.directors.len(), 1);
        let d = &config.directors[0];
        assert_eq!(d.name, "aslant");
        assert_eq!(d.policy, "cookie:jt");
        assert_eq!(d.ping, "/healthz");
        assert_eq!(d.hosts, vec!["(www.)?aslant.site"]);
        assert_eq!(d.rewrites, vec!["/api/*:/$1"]);
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let yaml = r#"
directors:
  - name: bad
    policy: leastConn
    backends: ["http://b:80"]
"#;
        assert!(matches!(
            Config::parse(yaml),
            Err(Error::NotSupportPolicy(_))
        ));
    }

    #[test]
    fn test_invalid_identity_rejected() {
        let yaml = "identity: \"host bogus\"\n";
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_director_without_backends_rejected() {
        let yaml = r#"
directors:
  - name: empty
    backends: []
"#;
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_invalid_log_type_rejected() {
        assert!(Config::parse("logType: hourly\n").is_err());
    }
}
