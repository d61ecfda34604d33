//! リクエストステータスコーディネータ
//!
//! キーごとのリクエスト状態テーブルと永続ストアを束ねるクライアント。
//! 同一キーへの同時リクエストのうち1つだけをfetcherにし、残りを
//! waiterとして待機させる合流（coalescing）のプリミティブです。
//!
//! テーブル全体を単一のRwLockで保護します。クリティカルセクションは
//! すべてO(1)（clear_expired以外）なので、キー単位の細粒度ロックは
//! 持ちません。読み取りは共有ロック、状態遷移は排他ロックで行い、
//! ミス・期限切れの昇格時は排他ロック下で再チェックします。

use super::response::{now_unix, Response};
use super::status::{status_signal, RequestStatus, Status, StatusWaiter};
use super::store::Store;
use crate::error::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

/// 期限切れエントリ掃除のデフォルト猶予（秒）
///
/// cacheable判定直後のレコード読み出しと削除が競合しないよう、
/// TTL超過からこの秒数が経つまでは削除を遅らせます。
pub const DEFAULT_CLEAR_DELAY: u32 = 60;

/// ステータス別エントリ数の統計
#[derive(Debug, Default, Clone, Serialize)]
pub struct Stats {
    pub waiting: usize,
    pub fetching: usize,
    #[serde(rename = "hitForPass")]
    pub hit_for_pass: usize,
    pub cacheable: usize,
    /// ストアのファイルサイズ（MB）
    #[serde(rename = "fileSize")]
    pub file_size: usize,
}

/// cacheableエントリの一覧表示用
#[derive(Debug, Clone, Serialize)]
pub struct CachedEntry {
    pub key: String,
    pub ttl: u16,
    #[serde(rename = "createdAt")]
    pub created_at: u32,
}

/// fetching中エントリの一覧表示用
#[derive(Debug, Clone, Serialize)]
pub struct FetchingEntry {
    pub key: String,
    #[serde(rename = "createdAt")]
    pub created_at: u32,
}

/// キャッシュクライアント
pub struct CacheClient {
    store: Store,
    table: RwLock<HashMap<Vec<u8>, RequestStatus>>,
}

impl CacheClient {
    /// ストアを開いてクライアントを初期化
    pub fn open(path: &Path) -> Result<CacheClient> {
        Ok(CacheClient {
            store: Store::open(path)?,
            table: RwLock::new(HashMap::new()),
        })
    }

    /// キーに対応するリクエスト状態を取得
    ///
    /// - エントリなし・期限切れ・Fetching中のいずれかであれば排他ロックへ
    ///   昇格して再チェックし、自分がFetchingを確立できれば(Fetching, None)、
    ///   先客がいればwaiterを登録して(Waiting, Some(waiter))を返します。
    /// - それ以外はエントリの状態（HitForPass / Cacheable）をそのまま返します。
    pub fn get_request_status(&self, key: &[u8]) -> (Status, Option<StatusWaiter>) {
        let now = now_unix();
        {
            let table = self.table.read().unwrap();
            if let Some(entry) = table.get(key) {
                if !entry.is_expired(now) && entry.status != Status::Fetching {
                    return (entry.status, None);
                }
            }
        }
        self.lock_and_update(key, now)
    }

    /// 排他ロック下での再チェックと昇格
    fn lock_and_update(&self, key: &[u8], now: u32) -> (Status, Option<StatusWaiter>) {
        let mut table = self.table.write().unwrap();
        if let Some(entry) = table.get_mut(key) {
            if !entry.is_expired(now) {
                if entry.status == Status::Fetching {
                    let (signal, waiter) = status_signal();
                    entry.waiters.push(signal);
                    return (Status::Waiting, Some(waiter));
                }
                return (entry.status, None);
            }
        }
        // エントリなし、または期限切れ。自分がfetcherになる
        table.insert(
            key.to_vec(),
            RequestStatus {
                created_at: now,
                ttl: 0,
                status: Status::Fetching,
                waiters: Vec::new(),
            },
        );
        (Status::Fetching, None)
    }

    /// 状態を更新し、待機中のリクエストをすべて起床させる
    ///
    /// created_atはfetch開始時刻のまま変更しません。TTLはfetchの
    /// 開始から計測されます。エントリが既に削除されていた場合は
    /// 何もしません。
    pub fn update_request_status(&self, key: &[u8], status: Status, ttl: u16) {
        let waiters = {
            let mut table = self.table.write().unwrap();
            let entry = match table.get_mut(key) {
                Some(entry) => entry,
                None => return,
            };
            entry.status = status;
            entry.ttl = ttl;
            std::mem::take(&mut entry.waiters)
        };
        // FIFO順で確定後のステータスを配送
        for signal in waiters {
            signal.notify(status);
        }
    }

    /// hit for passとして記録
    pub fn hit_for_pass(&self, key: &[u8], ttl: u16) {
        self.update_request_status(key, Status::HitForPass, ttl);
    }

    /// cacheableとして記録
    pub fn cacheable(&self, key: &[u8], ttl: u16) {
        self.update_request_status(key, Status::Cacheable, ttl);
    }

    /// レスポンスレコードを永続化
    pub fn save_response(&self, key: &[u8], resp: &Response) -> Result<()> {
        let data = resp.encode()?;
        self.store.put(key, &data)
    }

    /// 永続化されたレスポンスレコードを取得
    ///
    /// 見つからない・空・デコード不能の場合はNoneを返し、呼び出し側が
    /// ミスとして扱います。
    pub fn get_response(&self, key: &[u8]) -> Option<Response> {
        let data = self.store.get(key).ok()??;
        if data.is_empty() {
            return None;
        }
        Response::decode(&data).ok()
    }

    /// ステータスエントリと永続レコードを削除
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let mut table = self.table.write().unwrap();
        table.remove(key);
        self.store.delete(key)
    }

    /// 期限切れエントリの掃除
    ///
    /// TTL超過からdelay秒が経過したエントリを、ステータステーブルと
    /// ストアの両方から削除します。
    pub fn clear_expired(&self, delay: u32) {
        let now = now_unix();
        let mut table = self.table.write().unwrap();
        table.retain(|key, entry| {
            let expired =
                entry.ttl != 0 && now.wrapping_sub(entry.created_at) > u32::from(entry.ttl) + delay;
            if expired {
                let _ = self.store.delete(key);
            }
            !expired
        });
    }

    /// ステータステーブルのエントリ数
    pub fn size(&self) -> usize {
        self.table.read().unwrap().len()
    }

    /// ステータス別の統計を取得
    pub fn stats(&self) -> Stats {
        let file_size = (self.store.file_size() / (1024 * 1024)) as usize;
        let table = self.table.read().unwrap();
        let mut stats = Stats {
            file_size,
            ..Default::default()
        };
        for entry in table.values() {
            match entry.status {
                Status::Fetching => {
                    stats.fetching += 1;
                    stats.waiting += entry.waiters.len();
                }
                Status::HitForPass => stats.hit_for_pass += 1,
                Status::Cacheable => stats.cacheable += 1,
                _ => {}
            }
        }
        stats
    }

    /// 有効なcacheableエントリの一覧
    pub fn get_cached_list(&self) -> Vec<CachedEntry> {
        let now = now_unix();
        let table = self.table.read().unwrap();
        table
            .iter()
            .filter(|(_, entry)| {
                entry.status == Status::Cacheable
                    && entry.created_at.wrapping_add(u32::from(entry.ttl)) >= now
            })
            .map(|(key, entry)| CachedEntry {
                key: String::from_utf8_lossy(key).into_owned(),
                ttl: entry.ttl,
                created_at: entry.created_at,
            })
            .collect()
    }

    /// fetching中エントリの一覧
    pub fn get_fetching_list(&self) -> Vec<FetchingEntry> {
        let table = self.table.read().unwrap();
        table
            .iter()
            .filter(|(_, entry)| entry.status == Status::Fetching)
            .map(|(key, entry)| FetchingEntry {
                key: String::from_utf8_lossy(key).into_owned(),
                created_at: entry.created_at,
            })
            .collect()
    }

    /// ストアをフラッシュして閉じる
    pub fn close(&self) -> Result<()> {
        self.store.close()
    }

    #[cfg(test)]
    fn set_entry(&self, key: &[u8], created_at: u32, ttl: u16, status: Status) {
        let mut table = self.table.write().unwrap();
        table.insert(
            key.to_vec(),
            RequestStatus {
                created_at,
                ttl,
                status,
                waiters: Vec::new(),
            },
        );
    }
}
