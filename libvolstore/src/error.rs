use common::{NameError, PolicyError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("watch start revision is older than the compacted revision {0}")]
    Compacted(i64),
    #[error("watch canceled by the store: {0}")]
    Canceled(String),
    #[error("watch disconnected")]
    Disconnected,
    #[error("watch fell behind by {0} events")]
    Lagged(u64),
    #[error("decoding record at {key}: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Name(#[from] NameError),
    #[error("policy {policy} is still used by {count} volume(s)")]
    PolicyInUse { policy: String, count: usize },
    #[error(transparent)]
    Xline(#[from] Box<etcd_client::Error>),
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        StoreError::Xline(Box::new(e))
    }
}
