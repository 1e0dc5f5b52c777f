use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::core::errors::{CoordError, Result};

/// Install a global fmt subscriber capped at `level`.
/// Fails if a global subscriber is already set.
pub fn init_tracing(level: Level) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| CoordError::Internal(format!("tracing already initialised: {}", e)))
}

/// Parse a level name such as `info` or `DEBUG`
pub fn parse_level(name: &str) -> Result<Level> {
    name.parse::<Level>()
        .map_err(|_| CoordError::InvalidConfiguration(format!("unknown log level '{}'", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_level("WARN").unwrap(), Level::WARN);
        assert!(parse_level("chatty").is_err());
    }
}
