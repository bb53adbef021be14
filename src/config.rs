//! Upload routing configuration, validated at construction and shipped to
//! the API as `Filelib-Config-*` headers.

use reqwest::header::HeaderMap;
use smol_str::SmolStr;

use crate::error::Error;
use crate::models::{h, CONFIG_ACCESS_HEADER, CONFIG_PREFIX_HEADER, CONFIG_STORAGE_HEADER};

/// Routing parameters for an upload: target storage, key prefix and
/// access level. Immutable after construction.
#[derive(Debug, Clone)]
pub struct FilelibConfig {
    storage: SmolStr,
    prefix: SmolStr,
    access: SmolStr,
}

impl FilelibConfig {
    /// Creates a config with an empty prefix and `private` access.
    pub fn new(storage: impl Into<SmolStr>) -> Result<FilelibConfig, Error> {
        FilelibConfig::with_options(storage, "", "private")
    }

    pub fn with_options(
        storage: impl Into<SmolStr>,
        prefix: impl Into<SmolStr>,
        access: impl Into<SmolStr>,
    ) -> Result<FilelibConfig, Error> {
        let config = FilelibConfig {
            storage: storage.into(),
            prefix: prefix.into(),
            access: access.into(),
        };

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.storage.is_empty() {
            return Err(Error::ConfigValidation("`storage` for config must be provided."));
        }

        // Prefix is a key fragment; empty is allowed.
        if !self.prefix.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'/')) {
            return Err(Error::ConfigPrefixInvalid);
        }

        // Values travel as headers, so they must be representable there.
        for value in [&self.storage, &self.access] {
            if reqwest::header::HeaderValue::from_str(value).is_err() {
                return Err(Error::ConfigValidation("Config values must be usable as header values."));
            }
        }

        Ok(())
    }

    pub fn storage(&self) -> &str {
        &self.storage
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn access(&self) -> &str {
        &self.access
    }

    /// Generates the request headers carrying these values to the API.
    pub fn to_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        h!(headers.CONFIG_STORAGE_HEADER => &self.storage);
        h!(headers.CONFIG_PREFIX_HEADER => &self.prefix);
        h!(headers.CONFIG_ACCESS_HEADER => &self.access);

        headers
    }
}
