use thiserror::Error;

/// Top-level error type for the Waypoint history engine.
///
/// Storage crates map their backend errors into `Storage` with a context
/// string so that `?` works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WaypointError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid URL: {0}")]
    Url(String),

    #[error("History profile unavailable: {0}")]
    ProfileUnavailable(String),

    #[error("Request canceled")]
    Canceled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl From<toml::de::Error> for WaypointError {
    fn from(err: toml::de::Error) -> Self {
        WaypointError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for WaypointError {
    fn from(err: toml::ser::Error) -> Self {
        WaypointError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for WaypointError {
    fn from(err: serde_json::Error) -> Self {
        WaypointError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for WaypointError {
    fn from(err: url::ParseError) -> Self {
        WaypointError::Url(err.to_string())
    }
}

/// A specialized `Result` type for Waypoint operations.
pub type Result<T> = std::result::Result<T, WaypointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WaypointError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: WaypointError = io_err.into();
        assert!(matches!(err, WaypointError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_url_parse_error_conversion() {
        let parse_err = url::Url::parse("not a url").unwrap_err();
        let err: WaypointError = parse_err.into();
        assert!(matches!(err, WaypointError::Url(_)));
    }

    #[test]
    fn test_toml_error_conversion() {
        let toml_err = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let err: WaypointError = toml_err.into();
        assert!(matches!(err, WaypointError::Config(_)));
    }

    #[test]
    fn test_unit_variants_display() {
        assert_eq!(WaypointError::Canceled.to_string(), "Request canceled");
        assert_eq!(
            WaypointError::ShuttingDown.to_string(),
            "Shutdown in progress"
        );
        assert_eq!(
            WaypointError::ProfileUnavailable("History".into()).to_string(),
            "History profile unavailable: History"
        );
    }
}
