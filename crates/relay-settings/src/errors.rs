//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The file is not JSON, or its values do not fit the settings shape.
    #[error("malformed settings in {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serverUrl must be an http(s) URL, got {0:?}")]
    ServerUrl(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_names_the_file() {
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = SettingsError::Malformed {
            path: PathBuf::from("/home/me/.relay/settings.json"),
            source,
        };
        assert!(err
            .to_string()
            .starts_with("malformed settings in /home/me/.relay/settings.json"));
    }

    #[test]
    fn server_url_display() {
        let err = SettingsError::ServerUrl("ftp://box".into());
        assert_eq!(
            err.to_string(),
            "serverUrl must be an http(s) URL, got \"ftp://box\""
        );
    }
}
