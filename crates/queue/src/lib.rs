pub mod embed;
mod engine;
mod item;

pub use engine::{
    completed_key, scheduled_key, Queue, Updates, COMPLETED_PREFIX, SCHEDULED_PREFIX,
};
pub use item::{encode_key, Item, MAX_PROGRESS, MAX_WEIGHT};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] kv::Error),
    #[error("readiness probe timed out after {0:?}")]
    ProbeTimeout(std::time::Duration),
    #[error("operation canceled")]
    Canceled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("embedded etcd server exited during startup: {0}")]
    ServerExited(String),
    #[error("embedded etcd server not ready after {0:?}")]
    StartupTimeout(std::time::Duration),
    #[error("embedded etcd server startup canceled")]
    StartupCanceled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
