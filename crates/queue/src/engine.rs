use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use kv::{Event, Store, Watch, WatchTarget};

use crate::item::MAX_PROGRESS;
use crate::Item;

/// Prefix under which live items are written and updated.
pub const SCHEDULED_PREFIX: &str = "_schd";

/// Prefix into which items are moved at terminal progress. Never watched
/// by the engine; retained until an external compactor removes it.
pub const COMPLETED_PREFIX: &str = "_cmpl";

/// Capacity of the update streams returned by enqueue and watch.
const UPDATE_BUFFER: usize = 100;

/// Budget for the construction-time linearizable read.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// Read once at construction to force leader election; never written.
const PROBE_KEY: &str = "_ready";

pub fn scheduled_key(key: &str) -> String {
    format!("{SCHEDULED_PREFIX}/{key}")
}

pub fn completed_key(key: &str) -> String {
    format!("{COMPLETED_PREFIX}/{key}")
}

/// Stream of successive observed states of one item: a bounded,
/// single-consumer channel, closed on terminal state, error, or
/// cancellation.
pub type Updates = ReceiverStream<Item>;

/// Priority job queue over a linearizable, watchable key-value store.
///
/// Items are keyed so that the lexicographically first key under a
/// bucket's scheduled prefix is the highest-weight, oldest unfinished
/// item. Workers publish progress by re-enqueueing under the same key;
/// every subscriber of that key observes each overwrite through the
/// store's watch mechanism.
pub struct Queue {
    store: Arc<dyn Store>,
    // Serializes enqueue and dequeue mutations so that a key is observably
    // in at most one of the two namespaces.
    write_mu: Mutex<()>,
    stop: CancellationToken,
}

impl Queue {
    /// Builds a queue over `store`.
    ///
    /// Issues one linearizable read before accepting work, so the
    /// underlying store elects a leader now rather than on the first real
    /// operation. Construction fails if the read does not complete within
    /// five seconds.
    pub async fn new(store: Arc<dyn Store>) -> crate::Result<Queue> {
        match tokio::time::timeout(PROBE_TIMEOUT, store.get(PROBE_KEY)).await {
            Ok(read) => {
                read?;
            }
            Err(_) => return Err(crate::Error::ProbeTimeout(PROBE_TIMEOUT)),
        }
        Ok(Queue {
            store,
            write_mu: Mutex::new(()),
            stop: CancellationToken::new(),
        })
    }

    /// Stops the queue: every in-flight update stream terminates. Items in
    /// the store are untouched.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Writes `item` into the scheduled namespace and returns a stream of
    /// every subsequently observed change to it, closed once the item
    /// reaches a terminal state or `cancel` fires.
    ///
    /// An item at terminal progress is instead moved to the completed
    /// namespace in this call, emitted once, and the stream closed: this
    /// is how workers report completion. Invalid input (empty bucket or
    /// key), serialization failures, and store errors each surface as one
    /// synthetic item with a non-empty error, after which the stream
    /// closes. The engine never retries; re-enqueueing the same key is an
    /// overwrite, not a duplicate.
    #[tracing::instrument(level = "debug", skip_all, fields(key = %item.key, progress = item.progress))]
    pub async fn enqueue(&self, cancel: CancellationToken, item: Item) -> Updates {
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);

        if item.bucket.is_empty() || item.key.is_empty() {
            fail_stream(&tx, with_error(&item, "enqueue requires a bucket and key")).await;
            return ReceiverStream::new(rx);
        }
        let value = match serde_json::to_string(&item) {
            Ok(value) => value,
            Err(err) => {
                fail_stream(&tx, with_error(&item, format!("serializing item: {err}"))).await;
                return ReceiverStream::new(rx);
            }
        };

        let guard = self.write_mu.lock().await;

        // The overwrite re-fires the watch of every current subscriber of
        // this key, including a terminal write.
        if let Err(err) = self.store.put(&scheduled_key(&item.key), &value).await {
            drop(guard);
            fail_stream(&tx, with_error(&item, err)).await;
            return ReceiverStream::new(rx);
        }

        if item.progress == MAX_PROGRESS {
            // Terminal transition. The key leaves the scheduled namespace
            // before the completed copy lands, so it is never in both.
            let moved: kv::Result<()> = async {
                self.store.delete(&scheduled_key(&item.key)).await?;
                self.store.put(&completed_key(&item.key), &value).await?;
                Ok(())
            }
            .await;
            drop(guard);

            match moved {
                Ok(()) => {
                    tracing::debug!("item completed");
                    let _ = tx.send(item).await;
                }
                Err(err) => fail_stream(&tx, with_error(&item, err)).await,
            }
            return ReceiverStream::new(rx);
        }

        let watch = self
            .store
            .watch(WatchTarget::Key(scheduled_key(&item.key)), true)
            .await;
        drop(guard);

        let watch = match watch {
            Ok(watch) => watch,
            Err(err) => {
                fail_stream(&tx, with_error(&item, err)).await;
                return ReceiverStream::new(rx);
            }
        };

        tracing::debug!("item scheduled");
        tokio::spawn(fan_in(watch, item, tx, cancel, self.stop.clone()));
        ReceiverStream::new(rx)
    }

    /// Resolves the front of `bucket`: the lexicographically first key
    /// under its scheduled prefix, which the codec makes the
    /// highest-weight, oldest unfinished item.
    ///
    /// If the bucket is empty, waits for the first item to appear. Exactly
    /// one item is delivered on the returned stream in every outcome.
    #[tracing::instrument(level = "debug", skip_all, fields(bucket = %bucket))]
    pub async fn front(&self, cancel: CancellationToken, bucket: &str) -> Updates {
        let (tx, rx) = mpsc::channel(1);
        let prefix = format!("{SCHEDULED_PREFIX}/{bucket}/");

        // No engine lock here: the store's linearizability carries it.
        match self.store.first_under(&prefix).await {
            Ok(Some(found)) => {
                let _ = tx.send(parse_or_error(bucket, &found.value)).await;
                return ReceiverStream::new(rx);
            }
            Ok(None) => (),
            Err(err) => {
                let item = error_item(bucket, format!("reading front of bucket: {err}"));
                let _ = tx.send(item).await;
                return ReceiverStream::new(rx);
            }
        }

        let watch = match self.store.watch(WatchTarget::Prefix(prefix), false).await {
            Ok(watch) => watch,
            Err(err) => {
                let item = error_item(bucket, format!("watching bucket: {err}"));
                let _ = tx.send(item).await;
                return ReceiverStream::new(rx);
            }
        };

        tokio::spawn(front_wait(
            watch,
            bucket.to_string(),
            tx,
            cancel,
            self.stop.clone(),
        ));
        ReceiverStream::new(rx)
    }

    /// Unconditionally removes `item` from the scheduled namespace.
    ///
    /// Subscribers observe the deletion and, because the last written
    /// progress was below terminal, report the item as canceled. Deleting
    /// an absent key succeeds, so dequeue is idempotent. The item is not
    /// moved to the completed namespace. If `cancel` fires before the
    /// mutation starts, the store is left untouched and an error is
    /// returned; a deletion already issued is not aborted.
    #[tracing::instrument(level = "debug", skip_all, fields(key = %item.key))]
    pub async fn dequeue(&self, cancel: CancellationToken, item: &Item) -> crate::Result<()> {
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(crate::Error::Canceled),
            guard = self.write_mu.lock() => guard,
        };
        let deleted = self.store.delete(&scheduled_key(&item.key)).await?;
        tracing::debug!(deleted, "dequeued item");
        Ok(())
    }

    /// Forwards every observed overwrite of `key` (the raw item key, not
    /// the namespaced one) until `cancel` fires.
    ///
    /// Malformed events surface as synthetic error items without closing
    /// the stream; the next event may be valid.
    #[tracing::instrument(level = "debug", skip_all, fields(key = %key))]
    pub async fn watch(&self, cancel: CancellationToken, key: &str) -> Updates {
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);

        let watch = match self
            .store
            .watch(WatchTarget::Key(scheduled_key(key)), false)
            .await
        {
            Ok(watch) => watch,
            Err(err) => {
                let bucket = key.split('/').next().unwrap_or("");
                let item = error_item(bucket, format!("watching key: {err}"));
                let _ = tx.send(item).await;
                return ReceiverStream::new(rx);
            }
        };

        tokio::spawn(watch_updates(
            watch,
            key.to_string(),
            tx,
            cancel,
            self.stop.clone(),
        ));
        ReceiverStream::new(rx)
    }
}

/// Fan-in task behind one enqueue stream. Owns its watch subscription and
/// its output channel; holds no reference back to the engine.
async fn fan_in(
    mut watch: Watch,
    seed: Item,
    tx: mpsc::Sender<Item>,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(with_error(&seed, "enqueue canceled: context canceled")).await;
                return;
            }
            _ = stop.cancelled() => {
                let _ = tx.send(with_error(&seed, "enqueue canceled: queue stopped")).await;
                return;
            }
            batch = watch.recv() => batch,
        };
        let mut events = match batch {
            None => {
                let _ = tx.send(with_error(&seed, "item watch ended unexpectedly")).await;
                return;
            }
            Some(Err(err)) => {
                let _ = tx.send(with_error(&seed, format!("item watch failed: {err}"))).await;
                return;
            }
            Some(Ok(events)) => events,
        };

        // A single-key watch must deliver exactly one event per response.
        if events.len() != 1 {
            let count = events.len();
            let _ = tx
                .send(with_error(&seed, format!("expected one watch event, got {count}")))
                .await;
            return;
        }
        let Some(event) = events.pop() else { return };

        match event {
            Event::Put(kv) => {
                let update: Item = match serde_json::from_str(&kv.value) {
                    Ok(update) => update,
                    Err(err) => {
                        let _ = tx
                            .send(with_error(&seed, format!("decoding item update: {err}")))
                            .await;
                        return;
                    }
                };
                let errored = !update.error.is_empty();
                let terminal = update.progress == MAX_PROGRESS;
                if tx.send(update).await.is_err() {
                    return;
                }
                if errored || terminal {
                    // A terminal write closes the stream; its writer moves
                    // the item to the completed namespace.
                    return;
                }
            }
            Event::Delete { prev, .. } => {
                let last = match prev {
                    Some(kv) => match serde_json::from_str::<Item>(&kv.value) {
                        Ok(mut last) => {
                            if last.progress != MAX_PROGRESS {
                                // Deleted before terminal progress: canceled.
                                last.canceled = true;
                            }
                            last
                        }
                        Err(err) => {
                            with_error(&seed, format!("decoding deleted item: {err}"))
                        }
                    },
                    None => with_error(&seed, "delete event missing previous value"),
                };
                tracing::debug!(canceled = last.canceled, "item left scheduled namespace");
                let _ = tx.send(last).await;
                return;
            }
        }
    }
}

/// Waits for the first item to land in an empty bucket.
async fn front_wait(
    mut watch: Watch,
    bucket: String,
    tx: mpsc::Sender<Item>,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(error_item(&bucket, "front canceled: context canceled")).await;
                return;
            }
            _ = stop.cancelled() => {
                let _ = tx.send(error_item(&bucket, "front canceled: queue stopped")).await;
                return;
            }
            batch = watch.recv() => batch,
        };
        let events = match batch {
            None => {
                let _ = tx.send(error_item(&bucket, "bucket watch ended unexpectedly")).await;
                return;
            }
            Some(Err(err)) => {
                let _ = tx
                    .send(error_item(&bucket, format!("bucket watch failed: {err}")))
                    .await;
                return;
            }
            Some(Ok(events)) => events,
        };

        // The first put under the prefix is the new front. Deletes of
        // unrelated keys may interleave; skip them.
        for event in events {
            if let Event::Put(kv) = event {
                let _ = tx.send(parse_or_error(&bucket, &kv.value)).await;
                return;
            }
        }
    }
}

/// Long-lived forwarder behind one watch stream.
async fn watch_updates(
    mut watch: Watch,
    key: String,
    tx: mpsc::Sender<Item>,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    let bucket = key.split('/').next().unwrap_or("").to_string();
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(error_item(&bucket, "watch canceled: context canceled")).await;
                return;
            }
            _ = stop.cancelled() => {
                let _ = tx.send(error_item(&bucket, "watch canceled: queue stopped")).await;
                return;
            }
            batch = watch.recv() => batch,
        };
        let events = match batch {
            None => return,
            Some(Err(err)) => {
                let _ = tx
                    .send(error_item(&bucket, format!("item watch failed: {err}")))
                    .await;
                continue;
            }
            Some(Ok(events)) => events,
        };

        for event in events {
            if let Event::Put(kv) = event {
                let update = parse_or_error(&bucket, &kv.value);
                if tx.send(update).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn parse_or_error(bucket: &str, raw: &str) -> Item {
    match serde_json::from_str(raw) {
        Ok(item) => item,
        Err(err) => error_item(bucket, format!("decoding item: {err}")),
    }
}

/// Synthetic item carrying only an error, for streams with no input item.
fn error_item(bucket: &str, error: impl ToString) -> Item {
    Item {
        bucket: bucket.to_string(),
        created_at: Utc::now(),
        key: String::new(),
        value: String::new(),
        progress: 0,
        canceled: false,
        error: error.to_string(),
        request_id: String::new(),
    }
}

fn with_error(seed: &Item, error: impl ToString) -> Item {
    let mut item = seed.clone();
    item.error = error.to_string();
    item
}

async fn fail_stream(tx: &mpsc::Sender<Item>, item: Item) {
    tracing::warn!(key = %item.key, error = %item.error, "closing update stream with error");
    let _ = tx.send(item).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kv::KeyValue;

    // Store whose reads never complete; the probe must give up on it.
    struct StalledStore;

    #[async_trait]
    impl Store for StalledStore {
        async fn put(&self, _key: &str, _value: &str) -> kv::Result<()> {
            std::future::pending().await
        }
        async fn delete(&self, _key: &str) -> kv::Result<i64> {
            std::future::pending().await
        }
        async fn first_under(&self, _prefix: &str) -> kv::Result<Option<KeyValue>> {
            std::future::pending().await
        }
        async fn get(&self, _key: &str) -> kv::Result<Option<KeyValue>> {
            std::future::pending().await
        }
        async fn watch(&self, _target: WatchTarget, _prev_kv: bool) -> kv::Result<Watch> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_probe_failure_fails_construction() {
        let result = Queue::new(Arc::new(StalledStore)).await;
        assert!(matches!(result, Err(crate::Error::ProbeTimeout(_))));
    }

    #[test]
    fn namespaced_keys() {
        assert_eq!(scheduled_key("b/123"), "_schd/b/123");
        assert_eq!(completed_key("b/123"), "_cmpl/b/123");
    }
}
