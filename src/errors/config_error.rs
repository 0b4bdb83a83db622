use thiserror::Error;

/// Errors raised while loading runtime configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config file '{path}': {source}")]
    ConfigParseError {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to read config file '{path}': {source}")]
    ConfigReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
