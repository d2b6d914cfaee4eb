//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// krpc-dht crate error enum.
pub enum Error {
    /// For starter, to remove as code matures.
    #[error("Generic error: {0}")]
    Generic(String),
    /// For starter, to remove as code matures.
    #[error("Static error: {0}")]
    Static(&'static str),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    /// Indicates that the message transaction_id is not the expected size.
    #[error("Invalid transaction_id: {0:?}")]
    InvalidTransactionId(Vec<u8>),

    /// The remote node answered with a KRPC error message.
    #[error("Error response {code}: {description}")]
    ErrorResponse { code: i32, description: String },

    /// The call reached its hard timeout without a response.
    #[error("Request timed out")]
    Timeout,

    /// The server or the dht was shut down before the operation completed.
    #[error("Dht is shutdown")]
    Shutdown,
}

/// Alias for `Result<T, krpc_dht::Error>`.
pub type Result<T, E = Error> = core::result::Result<T, E>;
