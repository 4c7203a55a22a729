use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::store::WatchSender;
use crate::{Event, KeyValue, Store, Watch, WatchTarget};

/// In-memory `Store` backend.
///
/// State and the watcher registry live under one lock, so a mutation and
/// its fan-out to watchers are atomic: watchers observe mutations of a key
/// in exactly the order they were applied. Every batch carries exactly one
/// event. Intended for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, String>,
    watchers: Vec<Watcher>,
}

struct Watcher {
    target: WatchTarget,
    prev_kv: bool,
    sender: WatchSender,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    /// Deliver one event to every live watcher of `key`, pruning watchers
    /// whose subscription has dropped.
    fn broadcast(&mut self, key: &str, make: impl Fn(bool) -> Event) {
        self.watchers.retain(|w| {
            if !w.target.matches(key) {
                return !w.sender.is_closed();
            }
            w.sender.send(Ok(vec![make(w.prev_kv)]))
        });
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, key: &str, value: &str) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.data.insert(key.to_string(), value.to_string());

        let kv = KeyValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        inner.broadcast(key, |_| Event::Put(kv.clone()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> crate::Result<i64> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let Some(value) = inner.data.remove(key) else {
            return Ok(0);
        };

        let prev = KeyValue {
            key: key.to_string(),
            value,
        };
        inner.broadcast(key, |prev_kv| Event::Delete {
            key: key.to_string(),
            prev: prev_kv.then(|| prev.clone()),
        });
        Ok(1)
    }

    async fn first_under(&self, prefix: &str) -> crate::Result<Option<KeyValue>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .next()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KeyValue {
                key: key.clone(),
                value: value.clone(),
            }))
    }

    async fn get(&self, key: &str) -> crate::Result<Option<KeyValue>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.data.get(key).map(|value| KeyValue {
            key: key.to_string(),
            value: value.clone(),
        }))
    }

    async fn watch(&self, target: WatchTarget, prev_kv: bool) -> crate::Result<Watch> {
        let (sender, watch) = Watch::channel();
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.watchers.push(Watcher {
            target,
            prev_kv,
            sender,
        });
        Ok(watch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_is_ordered_before_watch_delivery() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let mut watch = store
            .watch(WatchTarget::Key("k".to_string()), false)
            .await?;

        store.put("k", "one").await?;
        store.put("k", "two").await?;

        for want in ["one", "two"] {
            let events = watch.recv().await.expect("watch live")?;
            assert_eq!(events.len(), 1);
            assert_eq!(
                events[0],
                Event::Put(KeyValue {
                    key: "k".to_string(),
                    value: want.to_string(),
                })
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn delete_retains_previous_value() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.put("k", "v").await?;

        let mut with_prev = store.watch(WatchTarget::Key("k".to_string()), true).await?;
        let mut without = store
            .watch(WatchTarget::Key("k".to_string()), false)
            .await?;

        assert_eq!(store.delete("k").await?, 1);

        let events = with_prev.recv().await.expect("watch live")?;
        assert_eq!(
            events[0],
            Event::Delete {
                key: "k".to_string(),
                prev: Some(KeyValue {
                    key: "k".to_string(),
                    value: "v".to_string(),
                }),
            }
        );

        let events = without.recv().await.expect("watch live")?;
        assert_eq!(
            events[0],
            Event::Delete {
                key: "k".to_string(),
                prev: None,
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn delete_of_absent_key_is_silent() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let mut watch = store
            .watch(WatchTarget::Prefix("p/".to_string()), false)
            .await?;

        assert_eq!(store.delete("p/missing").await?, 0);
        assert_eq!(store.delete("p/missing").await?, 0);

        // Only the put that follows is observed.
        store.put("p/a", "v").await?;
        let events = watch.recv().await.expect("watch live")?;
        assert!(matches!(&events[0], Event::Put(kv) if kv.key == "p/a"));
        Ok(())
    }

    #[tokio::test]
    async fn first_under_returns_smallest_key() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        assert_eq!(store.first_under("jobs/").await?, None);

        store.put("jobs/20", "b").await?;
        store.put("jobs/10", "a").await?;
        store.put("jobz", "outside").await?;

        let first = store.first_under("jobs/").await?.expect("present");
        assert_eq!(first.key, "jobs/10");
        assert_eq!(first.value, "a");
        Ok(())
    }

    #[tokio::test]
    async fn prefix_watch_scopes_to_prefix() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let mut watch = store
            .watch(WatchTarget::Prefix("a/".to_string()), false)
            .await?;

        store.put("b/other", "x").await?;
        store.put("a/one", "y").await?;

        let events = watch.recv().await.expect("watch live")?;
        assert!(matches!(&events[0], Event::Put(kv) if kv.key == "a/one"));
        Ok(())
    }

    #[tokio::test]
    async fn dropped_watch_is_pruned() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let watch = store.watch(WatchTarget::Key("k".to_string()), false).await?;
        drop(watch);

        store.put("k", "v").await?;
        assert!(store.inner.lock().expect("lock").watchers.is_empty());
        Ok(())
    }
}
