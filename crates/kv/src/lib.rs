mod etcd;
mod mem;
mod store;

pub use etcd::EtcdStore;
pub use mem::MemoryStore;
pub use store::{Event, KeyValue, Store, Watch, WatchTarget};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Etcd(#[from] etcd_client::Error),
    #[error("{0}")]
    Protocol(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
