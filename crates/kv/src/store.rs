use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// A key and its current value, both UTF-8 strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// One observed mutation of a watched key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Put(KeyValue),
    /// Removal of `key`. `prev` carries the replaced value when the watch
    /// was opened with previous-value retention.
    Delete {
        key: String,
        prev: Option<KeyValue>,
    },
}

/// What a watch subscribes to: one exact key, or every key under a prefix.
#[derive(Debug, Clone)]
pub enum WatchTarget {
    Key(String),
    Prefix(String),
}

impl WatchTarget {
    pub(crate) fn matches(&self, key: &str) -> bool {
        match self {
            WatchTarget::Key(k) => key == k,
            WatchTarget::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

/// Contract required of the backing key-value store.
///
/// The store must be linearizable, and must preserve total ordering between
/// its own mutations and watch delivery: a caller that returns from
/// `put(k, v)` is guaranteed that every watch of `k` opened before that
/// return will subsequently observe an event for `v` (unless the watch is
/// dropped first).
#[async_trait]
pub trait Store: Send + Sync {
    /// Blind overwrite of `key`.
    async fn put(&self, key: &str, value: &str) -> crate::Result<()>;

    /// Remove `key`, returning how many keys were deleted. Deleting an
    /// absent key is not an error.
    async fn delete(&self, key: &str) -> crate::Result<i64>;

    /// Linearizable read of the lexicographically smallest key under
    /// `prefix`.
    async fn first_under(&self, prefix: &str) -> crate::Result<Option<KeyValue>>;

    /// Linearizable single-key read.
    async fn get(&self, key: &str) -> crate::Result<Option<KeyValue>>;

    /// Subscribe to mutations of `target`. With `prev_kv` set, delete
    /// events retain the value they replaced.
    async fn watch(&self, target: WatchTarget, prev_kv: bool) -> crate::Result<Watch>;
}

/// A live watch subscription.
///
/// Events arrive in batches; each batch carries at least one event, in the
/// order the store applied them. Dropping the `Watch` cancels the
/// subscription.
pub struct Watch {
    rx: mpsc::UnboundedReceiver<crate::Result<Vec<Event>>>,
    _guard: DropGuard,
}

impl Watch {
    pub(crate) fn channel() -> (WatchSender, Watch) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let sender = WatchSender {
            tx,
            cancel: cancel.clone(),
        };
        let watch = Watch {
            rx,
            _guard: cancel.drop_guard(),
        };
        (sender, watch)
    }

    /// Receive the next event batch, or None once the subscription ends.
    pub async fn recv(&mut self) -> Option<crate::Result<Vec<Event>>> {
        self.rx.recv().await
    }
}

pub(crate) struct WatchSender {
    tx: mpsc::UnboundedSender<crate::Result<Vec<Event>>>,
    cancel: CancellationToken,
}

impl WatchSender {
    /// Deliver a batch. Returns false once the receiving `Watch` is gone.
    pub(crate) fn send(&self, batch: crate::Result<Vec<Event>>) -> bool {
        self.tx.send(batch).is_ok()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves when the receiving `Watch` has been dropped.
    pub(crate) async fn closed(&self) {
        self.cancel.cancelled().await
    }
}
