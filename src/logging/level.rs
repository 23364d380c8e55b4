use crate::error::{Result, ZeroFeedError};
use tracing::Level;

/// Parse a configured level name (case-insensitive)
pub fn parse_log_level(level_str: &str) -> Result<Level> {
    match level_str.trim().to_uppercase().as_str() {
        "TRACE" => Ok(Level::TRACE),
        "DEBUG" => Ok(Level::DEBUG),
        "INFO" => Ok(Level::INFO),
        "WARN" | "WARNING" => Ok(Level::WARN),
        "ERROR" => Ok(Level::ERROR),
        _ => Err(ZeroFeedError::config(format!(
            "Invalid log level: {}",
            level_str
        ))),
    }
}

/// Default filter directive when `RUST_LOG` is unset
pub fn default_directive(level: Level) -> String {
    format!(
        "zerofeed={},tokio_modbus=warn,reqwest=warn,hyper=warn",
        level.as_str().to_lowercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("Warning").unwrap(), Level::WARN);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn directive_names_crate() {
        let d = default_directive(Level::DEBUG);
        assert!(d.starts_with("zerofeed=debug"));
        assert!(d.contains("tokio_modbus=warn"));
    }
}
