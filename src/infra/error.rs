use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("failed to bind admin listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("admin server stopped unexpectedly")]
    Serve(#[source] std::io::Error),
    #[error("cache index database unavailable")]
    Database(#[from] sqlx::Error),
    #[error("cache index migrations failed")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl InfraError {
    pub fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Bind { addr, source }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn bind_error_keeps_io_source() {
        let addr: SocketAddr = "127.0.0.1:3001".parse().expect("addr");
        let err = InfraError::bind(addr, std::io::Error::other("address in use"));
        assert_eq!(
            err.to_string(),
            "failed to bind admin listener on 127.0.0.1:3001"
        );
        assert_eq!(
            err.source().map(ToString::to_string).as_deref(),
            Some("address in use")
        );
    }

    #[test]
    fn sqlx_errors_convert_into_database_variant() {
        let err = InfraError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, InfraError::Database(sqlx::Error::PoolTimedOut)));
    }
}
