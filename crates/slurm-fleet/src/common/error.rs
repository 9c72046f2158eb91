use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

impl From<serde_json::error::Error> for FleetError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::DeserializationError(e.to_string())
    }
}

impl From<serde_yaml::Error> for FleetError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::DeserializationError(e.to_string())
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}
