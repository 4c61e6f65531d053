#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("forward to backup {backup} failed")]
    ForwardFailed { backup: String },

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),
}

pub type Result<T> = std::result::Result<T, Error>;
