//! Error type shared by configuration, catalog loading and the key registry

use std::path::Path;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bootstrap config file could not be parsed or written
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catalog file is malformed or names values the registry rejects
    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Unknown metadata key '{0}'")]
    UnknownKey(String),

    /// A key name is already registered with a different value type
    #[error("Metadata key '{name}' already registered as {registered_as}")]
    KeyConflict { name: String, registered_as: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Attach the file the error came from
    ///
    /// Only message-carrying file errors are rewritten; the rest pass through.
    pub fn in_file(self, path: &Path) -> Self {
        match self {
            Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
            Error::Catalog(msg) => Error::Catalog(format!("{}: {}", path.display(), msg)),
            Error::UnknownKey(name) => Error::Catalog(format!("{}: unknown metadata key '{}'", path.display(), name)),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_file_prefixes_catalog_errors() {
        let err = Error::UnknownKey("tempo".into()).in_file(Path::new("/music/library.toml"));
        assert!(matches!(err, Error::Catalog(ref msg) if msg.starts_with("/music/library.toml:")));
        assert!(err.to_string().contains("tempo"));
    }

    #[test]
    fn test_in_file_keeps_other_kinds() {
        let err = Error::Internal("lock".into()).in_file(Path::new("x.toml"));
        assert!(matches!(err, Error::Internal(ref msg) if msg == "lock"));
    }

    #[test]
    fn test_key_conflict_message() {
        let err = Error::KeyConflict {
            name: "bpm".into(),
            registered_as: "Integer".into(),
        };
        assert_eq!(err.to_string(), "Metadata key 'bpm' already registered as Integer");
    }
}
