//! リクエストステータス
//!
//! キーごとのリクエスト状態と、fetching中のキーに到着した後続
//! リクエストを待機させるためのone-shotシグナルを提供します。
//!
//! シグナルは「値の格納＋waker起床」だけの小さなFutureです。
//! fetcher側スレッドがステータス確定時に`notify`で値を書き込み、
//! 待機側タスクはFutureの完了として確定後のステータスを受け取ります。

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// キーごとのリクエスト状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// キャッシュ不可。そのままbackendへ転送
    Pass = 1,
    /// このキーのfetchを1リクエストが所有中
    Fetching = 2,
    /// fetching中のキーに到着した後続リクエストの一時状態
    Waiting = 3,
    /// ネガティブキャッシュ。一定期間キャッシュを素通し
    HitForPass = 4,
    /// 有効な永続化レスポンスが存在する
    Cacheable = 5,
}

impl Status {
    /// X-Statusヘッダー等で使用する名称
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pass => "pass",
            Status::Fetching => "fetching",
            Status::Waiting => "waiting",
            Status::HitForPass => "hitForPass",
            Status::Cacheable => "cacheable",
        }
    }
}

/// ステータステーブルのエントリ
#[derive(Debug)]
pub struct RequestStatus {
    /// fetch開始時刻（エポック秒）。Update時にも変更されない
    pub created_at: u32,
    /// 有効期間（秒）。0は無期限（fetching中）
    pub ttl: u16,
    pub status: Status,
    /// fetching完了を待つリクエストのシグナル（FIFO順）
    pub waiters: Vec<StatusSignal>,
}

impl RequestStatus {
    /// 期限切れかどうか
    pub fn is_expired(&self, now: u32) -> bool {
        self.ttl != 0 && now.wrapping_sub(self.created_at) > u32::from(self.ttl)
    }
}

struct SignalState {
    value: Option<Status>,
    waker: Option<Waker>,
}

/// 通知側ハンドル
///
/// ステータステーブルのwaitersに保持され、`notify`で確定後の
/// ステータスを1度だけ配送します。
pub struct StatusSignal {
    inner: Arc<Mutex<SignalState>>,
}

impl std::fmt::Debug for StatusSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StatusSignal")
    }
}

impl StatusSignal {
    /// ステータスを配送して待機側を起床させる
    pub fn notify(self, status: Status) {
        let waker = {
            let mut state = self.inner.lock().unwrap();
            state.value = Some(status);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// 待機側Future
///
/// `notify`された値で完了します。通知側がドロップされた場合は
/// Fetchingとして起床し、呼び出し側が自分でfetchをやり直します。
pub struct StatusWaiter {
    inner: Arc<Mutex<SignalState>>,
}

impl Future for StatusWaiter {
    type Output = Status;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Status> {
        let mut state = self.inner.lock().unwrap();
        if let Some(value) = state.value {
            return Poll::Ready(value);
        }
        // 通知側が値を書かずに消えた場合（エントリのRemove等）は
        // 自力でのfetchに切り替える
        if Arc::strong_count(&self.inner) == 1 {
            return Poll::Ready(Status::Fetching);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// 通知側・待機側のペアを生成
pub fn status_signal() -> (StatusSignal, StatusWaiter) {
    let inner = Arc::new(Mutex::new(SignalState {
        value: None,
        waker: None,
    }));
    (
        StatusSignal {
            inner: inner.clone(),
        },
        StatusWaiter { inner },
    )
}
