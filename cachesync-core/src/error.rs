//! Error types and result aliases.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error in {context}: {error}")]
    Toml {
        error: toml::de::Error,
        context: String,
    },

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registry error for {address}: {message}")]
    Registry { address: String, message: String },

    #[error("Storage error for {key}: {message}")]
    Storage { key: String, message: String },

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Invalid mount metadata in label {label}: {message}")]
    Metadata { label: String, message: String },

    #[error("Build step error: {0}")]
    Step(String),

    #[error("Command `{command}` exited with {code}: {stderr}")]
    Exec {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Toml {
            error,
            context: "cachesync.toml".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
