//! Credential resolution for the Filelib API.
//!
//! Credentials are an `(api_key, api_secret)` pair loaded from an
//! INI-style credentials file or from environment variables:
//!
//! ```ini
//! [filelib]
//! api_key=<uuid>
//! api_secret=<uuid>
//! ```

use std::str::FromStr;

use ini::Ini;
use smol_str::SmolStr;

use crate::error::Error;
use crate::fs::expand_user;

pub const CREDENTIALS_FILE_SECTION_NAME: &str = "filelib";
pub const CREDENTIALS_FILE_SECTION_API_KEY: &str = "api_key";
pub const CREDENTIALS_FILE_SECTION_API_SECRET: &str = "api_secret";

pub const ENV_API_KEY_IDENTIFIER: &str = "FILELIB_API_KEY";
pub const ENV_API_SECRET_IDENTIFIER: &str = "FILELIB_API_SECRET";

/// Where credentials are read from when they are not provided directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    File,
    Env,
}

impl CredentialSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialSource::File => "file",
            CredentialSource::Env => "env",
        }
    }
}

impl FromStr for CredentialSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "file" => Ok(CredentialSource::File),
            "env" => Ok(CredentialSource::Env),
            other => Err(Error::UnsupportedCredentialsSource(other.to_owned())),
        }
    }
}

/// A resolved `(api_key, api_secret)` pair. Immutable after resolution.
#[derive(Clone)]
pub struct Credentials {
    api_key: SmolStr,
    api_secret: SmolStr,
}

// The secret must never reach logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Direct construction bypasses resolution entirely.
    pub fn new(api_key: impl Into<SmolStr>, api_secret: impl Into<SmolStr>) -> Credentials {
        Credentials {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Loads credentials from the named source.
    ///
    /// `path` is required for [`CredentialSource::File`] and ignored otherwise.
    pub fn resolve(source: CredentialSource, path: Option<&str>) -> Result<Credentials, Error> {
        match source {
            CredentialSource::File => {
                let Some(path) = path else {
                    return Err(Error::Validation(
                        "Path to credential file must be provided when source is file".to_owned(),
                    ));
                };

                Credentials::from_file(path)
            }
            CredentialSource::Env => Credentials::from_env(),
        }
    }

    fn from_file(path: &str) -> Result<Credentials, Error> {
        let path = std::path::absolute(expand_user(path))?;

        if !path.is_file() {
            return Err(Error::CredentialsFileDoesNotExist(path));
        }

        let ini = Ini::load_from_file(&path)
            .map_err(|e| Error::Validation(format!("Failed to parse credentials file: {e}")))?;

        let Some(section) = ini.section(Some(CREDENTIALS_FILE_SECTION_NAME)) else {
            return Err(Error::MissingCredentialSection);
        };

        let api_key = section
            .get(CREDENTIALS_FILE_SECTION_API_KEY)
            .ok_or(Error::CredentialSectionKeyMissing(CREDENTIALS_FILE_SECTION_API_KEY))?;

        let api_secret = section
            .get(CREDENTIALS_FILE_SECTION_API_SECRET)
            .ok_or(Error::CredentialSectionKeyMissing(CREDENTIALS_FILE_SECTION_API_SECRET))?;

        Ok(Credentials::new(api_key, api_secret))
    }

    fn from_env() -> Result<Credentials, Error> {
        let api_key = std::env::var(ENV_API_KEY_IDENTIFIER)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(Error::CredEnvKeyValueMissing(ENV_API_KEY_IDENTIFIER))?;

        let api_secret = std::env::var(ENV_API_SECRET_IDENTIFIER)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(Error::CredEnvKeyValueMissing(ENV_API_SECRET_IDENTIFIER))?;

        Ok(Credentials::new(api_key, api_secret))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub(crate) fn api_secret(&self) -> &str {
        &self.api_secret
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn source_spellings() {
        assert_eq!("file".parse::<CredentialSource>().unwrap(), CredentialSource::File);
        assert_eq!("env".parse::<CredentialSource>().unwrap(), CredentialSource::Env);

        assert!(matches!(
            "keychain".parse::<CredentialSource>(),
            Err(Error::UnsupportedCredentialsSource(s)) if s == "keychain"
        ));
    }

    #[test]
    fn resolve_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");

        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[filelib]").unwrap();
        writeln!(f, "api_key=iam_key").unwrap();
        writeln!(f, "api_secret=iam_secret").unwrap();

        let creds = Credentials::resolve(CredentialSource::File, path.to_str()).unwrap();
        assert_eq!(creds.api_key(), "iam_key");
        assert_eq!(creds.api_secret(), "iam_secret");
    }

    #[test]
    fn file_missing_section_and_keys() {
        let dir = tempfile::tempdir().unwrap();

        let no_section = dir.path().join("no_section");
        std::fs::write(&no_section, "[other]\napi_key=k\n").unwrap();
        assert!(matches!(
            Credentials::resolve(CredentialSource::File, no_section.to_str()),
            Err(Error::MissingCredentialSection)
        ));

        let no_secret = dir.path().join("no_secret");
        std::fs::write(&no_secret, "[filelib]\napi_key=k\n").unwrap();
        assert!(matches!(
            Credentials::resolve(CredentialSource::File, no_secret.to_str()),
            Err(Error::CredentialSectionKeyMissing("api_secret"))
        ));

        let empty = dir.path().join("empty_section");
        std::fs::write(&empty, "[filelib]\n").unwrap();
        assert!(matches!(
            Credentials::resolve(CredentialSource::File, empty.to_str()),
            Err(Error::CredentialSectionKeyMissing("api_key"))
        ));
    }

    #[test]
    fn file_does_not_exist() {
        assert!(matches!(
            Credentials::resolve(CredentialSource::File, Some("/definitely/not/here")),
            Err(Error::CredentialsFileDoesNotExist(_))
        ));
    }

    #[test]
    fn file_source_requires_a_path() {
        assert!(matches!(
            Credentials::resolve(CredentialSource::File, None),
            Err(Error::Validation(_))
        ));
    }

    // Env mutations live in one test so parallel runs never race on them.
    #[test]
    fn resolve_from_env() {
        std::env::set_var(ENV_API_KEY_IDENTIFIER, "env_key");
        std::env::set_var(ENV_API_SECRET_IDENTIFIER, "env_secret");

        let creds = Credentials::resolve(CredentialSource::Env, None).unwrap();
        assert_eq!(creds.api_key(), "env_key");
        assert_eq!(creds.api_secret(), "env_secret");

        std::env::set_var(ENV_API_SECRET_IDENTIFIER, "");
        assert!(matches!(
            Credentials::resolve(CredentialSource::Env, None),
            Err(Error::CredEnvKeyValueMissing(ENV_API_SECRET_IDENTIFIER))
        ));

        std::env::remove_var(ENV_API_KEY_IDENTIFIER);
        assert!(matches!(
            Credentials::resolve(CredentialSource::Env, None),
            Err(Error::CredEnvKeyValueMissing(ENV_API_KEY_IDENTIFIER))
        ));

        std::env::remove_var(ENV_API_SECRET_IDENTIFIER);
    }

    #[test]
    fn debug_redacts_the_secret() {
        let creds = Credentials::new("iam_key", "iam_secret");
        let rendered = format!("{creds:?}");

        assert!(rendered.contains("iam_key"));
        assert!(!rendered.contains("iam_secret"));
    }
}
