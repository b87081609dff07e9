use thiserror::Error;

/// Errors that startup needs to distinguish by kind rather than just log
/// and propagate.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("unrecognized on-disk schema version {0:?}")]
    UnknownVersion(String),
}
