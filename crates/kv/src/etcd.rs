use async_trait::async_trait;
use etcd_client::{EventType, GetOptions, SortOrder, SortTarget, WatchOptions};

use crate::store::WatchSender;
use crate::{Event, KeyValue, Store, Watch, WatchTarget};

/// `Store` backend over an etcd cluster.
///
/// Reads use etcd's default (linearizable) consistency. Each watch owns a
/// pump task that drains the gRPC stream into the `Watch` channel and
/// cancels the server-side watcher when the subscription drops.
pub struct EtcdStore {
    client: etcd_client::Client,
}

impl EtcdStore {
    pub async fn connect<E: AsRef<str>, S: AsRef<[E]>>(endpoints: S) -> crate::Result<Self> {
        let client = etcd_client::Client::connect(endpoints, None).await?;
        Ok(Self { client })
    }

    /// Round-trip a status RPC. Succeeds only once the cluster is serving.
    pub async fn status(&self) -> crate::Result<()> {
        self.client.maintenance_client().status().await?;
        Ok(())
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn put(&self, key: &str, value: &str) -> crate::Result<()> {
        self.client.kv_client().put(key, value, None).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> crate::Result<i64> {
        let resp = self.client.kv_client().delete(key, None).await?;
        Ok(resp.deleted())
    }

    async fn first_under(&self, prefix: &str) -> crate::Result<Option<KeyValue>> {
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend)
            .with_limit(1);
        let resp = self.client.kv_client().get(prefix, Some(options)).await?;
        resp.kvs().first().map(to_key_value).transpose()
    }

    async fn get(&self, key: &str) -> crate::Result<Option<KeyValue>> {
        let resp = self.client.kv_client().get(key, None).await?;
        resp.kvs().first().map(to_key_value).transpose()
    }

    async fn watch(&self, target: WatchTarget, prev_kv: bool) -> crate::Result<Watch> {
        let (key, mut options) = match &target {
            WatchTarget::Key(k) => (k.clone(), WatchOptions::new()),
            WatchTarget::Prefix(p) => (p.clone(), WatchOptions::new().with_prefix()),
        };
        if prev_kv {
            options = options.with_prev_key();
        }
        let (watcher, stream) = self.client.watch_client().watch(key, Some(options)).await?;

        let (sender, watch) = Watch::channel();
        tokio::spawn(pump(watcher, stream, sender));
        Ok(watch)
    }
}

async fn pump(
    mut watcher: etcd_client::Watcher,
    mut stream: etcd_client::WatchStream,
    sender: WatchSender,
) {
    loop {
        let message = tokio::select! {
            _ = sender.closed() => break,
            message = stream.message() => message,
        };
        match message {
            Ok(Some(resp)) => {
                if resp.canceled() {
                    tracing::debug!("server canceled watch");
                    break;
                }
                // Responses without events are progress notifications.
                if resp.events().is_empty() {
                    continue;
                }
                let batch = resp.events().iter().map(to_event).collect();
                if !sender.send(batch) {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = sender.send(Err(err.into()));
                break;
            }
        }
    }
    let _ = watcher.cancel().await;
}

fn to_event(event: &etcd_client::Event) -> crate::Result<Event> {
    let kv = event
        .kv()
        .ok_or(crate::Error::Protocol("watch event missing key-value"))?;

    match event.event_type() {
        EventType::Put => Ok(Event::Put(to_key_value(kv)?)),
        EventType::Delete => Ok(Event::Delete {
            key: kv.key_str()?.to_string(),
            prev: event.prev_kv().map(to_key_value).transpose()?,
        }),
    }
}

fn to_key_value(kv: &etcd_client::KeyValue) -> crate::Result<KeyValue> {
    Ok(KeyValue {
        key: kv.key_str()?.to_string(),
        value: kv.value_str()?.to_string(),
    })
}
