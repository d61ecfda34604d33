//! エラー型定義
//!
//! プロキシ全体で使用するエラー型と、HTTPステータスコードへの
//! マッピングを提供します。

use thiserror::Error;

/// kura全体のResult型
pub type Result<T> = std::result::Result<T, Error>;

/// プロキシ処理中に発生するエラー
#[derive(Error, Debug)]
pub enum Error {
    /// キャッシュレコードにボディが存在しない
    #[error("content not found")]
    ContentNotFound,

    /// リクエストにマッチするdirectorが存在しない
    #[error("director unavailable")]
    DirectorUnavailable,

    /// backend URLのパースに失敗
    #[error("parse backend url fail: {0}")]
    ParseBackendUrlFail(String),

    /// backendのURLテーブルが未初期化
    #[error("target url not init")]
    TargetUrlNotInit,

    /// シャットダウン中でpingが無効化されている
    #[error("server is disabled")]
    DisableServer,

    /// 未対応のbackend選択ポリシー
    #[error("not support the policy: {0}")]
    NotSupportPolicy(String),

    /// 同時処理数の上限超過
    #[error("too many requests, current concurrency is over the limit")]
    TooManyRequests,

    /// 管理APIのトークン不一致等
    #[error("access is not allowed")]
    AccessForbidden,

    /// upstreamへの接続タイムアウト
    #[error("gateway timeout")]
    GatewayTimeout,

    /// upstreamとの通信エラー
    #[error("upstream error: {0}")]
    Upstream(String),

    /// 永続化レコードの形式不正
    #[error("invalid cache record")]
    InvalidRecord,

    /// 設定ファイルの内容不正
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("store error: {0}")]
    Store(#[from] sled::Error),
}

impl Error {
    /// エラーに対応するHTTPステータスコードを返す
    ///
    /// recoverミドルウェアがエラーレスポンス生成時に使用します。
    pub fn status_code(&self) -> u16 {
        match self {
            Error::ContentNotFound => 404,
            Error::DirectorUnavailable => 503,
            Error::DisableServer => 503,
            Error::TooManyRequests => 503,
            Error::AccessForbidden => 401,
            Error::GatewayTimeout => 504,
            Error::Upstream(_) => 502,
            Error::ParseBackendUrlFail(_) | Error::TargetUrlNotInit => 502,
            Error::Io(_) => 502,
            _ => 500,
        }
    }
}
