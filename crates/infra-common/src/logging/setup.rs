use crate::config::Conf;
use crate::errors::types::{Error, Result};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt};

/// What the user agent's subscriber prints, and under which name
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    /// One JSON object per line instead of the human-readable format
    pub json: bool,
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            json: false,
            app_name: "rsua".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Override from the `log_level` and `log_json` keys, where present
    pub fn apply_conf(mut self, conf: &dyn Conf) -> Result<Self> {
        if let Some(level) = conf.get_str("log_level") {
            self.level = parse_log_level(level)?;
        }
        if let Some(json) = conf.get_bool("log_json")? {
            self.json = json;
        }
        Ok(self)
    }
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` directives are honoured on top of `config.level`. Installing a
/// second subscriber in the same process fails with [`Error::Logging`].
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());
    let builder = fmt::Subscriber::builder().with_env_filter(filter);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| Error::Logging(e.to_string()))
}

/// Level names are case-insensitive: `"debug"`, `"WARN"`
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level.trim()).map_err(|_| Error::Config(format!("invalid log level '{}'", level)))
}

pub fn log_welcome(app_name: &str, version: &str) {
    tracing::info!("{} {} starting", app_name, version);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfMap;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level(" WARN ").unwrap(), Level::WARN);
        assert!(matches!(parse_log_level("loud"), Err(Error::Config(_))));
    }

    #[test]
    fn test_conf_overrides_defaults() {
        let conf = ConfMap::new().with("log_level", "trace").with("log_json", "yes");
        let config = LoggingConfig::default().apply_conf(&conf).unwrap();
        assert_eq!(config.level, Level::TRACE);
        assert!(config.json);
        assert_eq!(config.app_name, "rsua");

        let untouched = LoggingConfig::default().apply_conf(&ConfMap::new()).unwrap();
        assert_eq!(untouched.level, Level::INFO);
        assert!(!untouched.json);
    }

    #[test]
    fn test_bad_conf_value_is_reported() {
        let conf = ConfMap::new().with("log_json", "maybe");
        assert!(LoggingConfig::default().apply_conf(&conf).is_err());
    }
}
