//! Unified error type for the resolver engine, mapped to process exit codes.

use thiserror::Error;

/// sysexits(3) codes used by the CLI.
const EX_SOFTWARE: i32 = 70;
const EX_IOERR: i32 = 74;
const EX_CONFIG: i32 = 78;

#[derive(Error, Debug)]
pub enum XlinkError {
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] crate::pool::PoolError),

    #[error("Geometry codec error: {0}")]
    Codec(#[from] crate::geometry::CodecError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for XlinkError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(crate::storage::StorageError::Database(e))
    }
}

pub type Result<T> = std::result::Result<T, XlinkError>;

impl XlinkError {
    /// Process exit code for this error variant.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => EX_CONFIG,
            Self::Storage(_) | Self::Io(_) => EX_IOERR,
            Self::Pool(_) | Self::Codec(_) | Self::Internal(_) => EX_SOFTWARE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(XlinkError::Config("bad".into()).exit_code(), EX_CONFIG);
        let io = XlinkError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(io.exit_code(), EX_IOERR);
        let internal = XlinkError::from(anyhow::anyhow!("boom"));
        assert_eq!(internal.exit_code(), EX_SOFTWARE);
        assert_eq!(internal.to_string(), "boom");
    }
}
