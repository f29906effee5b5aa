//! Startup errors

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading and validating relay configuration.
#[derive(Error, Debug)]
pub enum Error {
    /// A value is missing, out of range or inconsistent with another.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read {what} {}: {source}", path.display())]
    Read {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_error_names_the_file() {
        let err = Error::Read {
            what: "key_file",
            path: PathBuf::from("/run/secrets/service_key"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(
            err.to_string(),
            "failed to read key_file /run/secrets/service_key: no such file"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn parse_error_names_the_file() {
        let source = toml::from_str::<toml::Table>("listen_addr = ").unwrap_err();
        let err = Error::Parse {
            path: PathBuf::from("token-relay.toml"),
            source,
        };
        assert!(err.to_string().starts_with("failed to parse token-relay.toml:"));
    }

    #[test]
    fn config_error_message() {
        let err = Error::Config("upstream.endpoints must list at least one endpoint".into());
        assert_eq!(
            err.to_string(),
            "invalid configuration: upstream.endpoints must list at least one endpoint"
        );
    }
}
