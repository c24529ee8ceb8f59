use thiserror::Error;

/// Errors that can occur while bringing the tunnel up
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot resolve address: {0}")]
    Resolve(String),

    #[error("Tap device error: {0}")]
    Tap(String),

    #[error("Cipher key must not be empty")]
    EmptyKey,

    #[error("No local/remote address pair with a matching family for {0}")]
    FamilyMismatch(String),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
