//! The broker binary's own error enum, following the teacher's
//! per-crate `thiserror` pattern. `anyhow` is reserved for `main.rs`.

use cb_connector::ConnectorError;
use cb_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("connector: {0}")]
    Connector(#[from] ConnectorError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("agent `{agent}`: invalid predicate: {source}")]
    Predicate { agent: String, #[source] source: cb_eval::CompileError },
    #[error("config: {0}")]
    Config(#[from] cb_config::ConfigError),
}

pub type BrokerResult<T> = Result<T, BrokerError>;
