use thiserror::Error;

#[derive(Debug, Error)]
pub enum TollgateError {
    #[error("routing error: {0}")]
    Routing(#[from] crate::routing::RoutingError),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TollgateError>;
