//! # キャッシュモジュール
//!
//! レスポンスキャッシュとリクエスト合流の中核を提供します。
//!
//! ## アーキテクチャ
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  CacheClient                             │
//! │  ├─ ステータステーブル (RwLock<HashMap>) │← キー毎のリクエスト状態
//! │  └─ Store (sled)                         │← 永続化レコード
//! └──────────────────────────────────────────┘
//! ```
//!
//! - **ステータステーブル**: キー毎にPass/Fetching/HitForPass/Cacheableを
//!   管理し、fetching中のキーへの後続リクエストをwaiterとして待機させます。
//! - **レコード**: createdAt/statusCode/TTL/ヘッダーと、生・gzip・brの
//!   最大2つのボディバッファを単一バイナリとして永続化します。
//! - **コーデック**: 保存時圧縮と配信時のコンテンツネゴシエーションの
//!   両方で同じgzip/brotliヘルパーを使用します。

pub mod client;
pub mod codec;
pub mod headers;
pub mod response;
pub mod status;
pub mod store;

pub use client::{CacheClient, Stats};
pub use headers::Headers;
pub use response::{Response, COMPRESS_MIN_LENGTH};
pub use status::{Status, StatusWaiter};
