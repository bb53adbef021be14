//! Authentication against the Filelib API.
//!
//! A short-lived access token is acquired by POSTing a signed credential
//! assertion (HS256 JWT over the API secret) to the authentication
//! endpoint, then attached to every API request as a bearer header.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use smol_str::SmolStr;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::credentials::{CredentialSource, Credentials};
use crate::error::Error;
use crate::models::{AccessTokenData, ApiResponse};
use crate::{AUTHENTICATION_URL, REQUEST_CLIENT_SOURCE};

/// A bearer token with its expiry. Regenerated on demand.
#[derive(Debug, Clone)]
pub struct AccessToken {
    value: SmolStr,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_valid(&self) -> bool {
        !self.value.is_empty() && self.expires_at > Utc::now()
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

#[derive(Serialize)]
struct TokenClaims<'a> {
    api_key: &'a str,
    nonce: String,
    request_client_source: &'static str,
}

/// Authenticates the client and owns the access-token cache.
///
/// One instance is shared by every upload engine a [`Client`](crate::Client)
/// constructs. Token acquisition is single-flight: the token slot is held
/// behind an async mutex for the duration of the exchange, so concurrent
/// callers observe one outstanding request.
pub struct Authentication {
    credentials: Credentials,
    auth_url: SmolStr,
    http: reqwest::Client,
    token: Mutex<Option<AccessToken>>,
}

impl Authentication {
    pub fn new(credentials: Credentials) -> Authentication {
        Authentication {
            credentials,
            auth_url: SmolStr::new_static(AUTHENTICATION_URL),
            http: reqwest::Client::new(),
            token: Mutex::new(None),
        }
    }

    /// Resolves credentials from the named source first.
    pub fn resolve(source: CredentialSource, path: Option<&str>) -> Result<Authentication, Error> {
        Ok(Authentication::new(Credentials::resolve(source, path)?))
    }

    /// Points token acquisition at a different endpoint, for local or dev
    /// API deployments.
    pub fn with_auth_url(mut self, url: impl Into<SmolStr>) -> Authentication {
        self.auth_url = url.into();
        self
    }

    pub fn api_key(&self) -> &str {
        self.credentials.api_key()
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// True iff an access token is present and not expired.
    pub async fn is_access_token(&self) -> bool {
        self.token.lock().await.as_ref().is_some_and(AccessToken::is_valid)
    }

    pub async fn access_token(&self) -> Option<AccessToken> {
        self.token.lock().await.clone()
    }

    /// Forces a token exchange now, replacing any cached token.
    pub async fn acquire_access_token(&self) -> Result<(), Error> {
        let mut slot = self.token.lock().await;
        *slot = Some(self.request_token().await?);

        Ok(())
    }

    fn assertion(&self) -> Result<String, Error> {
        let claims = TokenClaims {
            api_key: self.credentials.api_key(),
            nonce: Uuid::new_v4().to_string(),
            request_client_source: REQUEST_CLIENT_SOURCE,
        };

        let key = EncodingKey::from_secret(self.credentials.api_secret().as_bytes());

        Ok(jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key)?)
    }

    async fn request_token(&self) -> Result<AccessToken, Error> {
        let jwt = self.assertion()?;

        debug!(url = %self.auth_url, "acquiring access token");

        let resp = self
            .http
            .post(self.auth_url.as_str())
            .header(AUTHORIZATION, format!("Bearer {jwt}"))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            let envelope: Option<ApiResponse<serde_json::Value>> = serde_json::from_str(&body).ok();
            let reason = envelope
                .and_then(|e| e.error.map(|s| s.to_string()))
                .unwrap_or_else(|| format!("unreadable response (HTTP {status})"));

            return Err(Error::AcquiringAccessTokenFailed(reason));
        }

        let envelope: ApiResponse<AccessTokenData> = serde_json::from_str(&body)
            .map_err(|_| Error::AcquiringAccessTokenFailed(format!("unreadable response (HTTP {status})")))?;

        let Some(data) = envelope.data else {
            return Err(Error::AcquiringAccessTokenFailed("response is missing token data".to_owned()));
        };

        let expires_at = DateTime::parse_from_rfc3339(&data.expiration)
            .map_err(|e| Error::AcquiringAccessTokenFailed(format!("bad expiration timestamp: {e}")))?
            .with_timezone(&Utc);

        Ok(AccessToken {
            value: data.access_token,
            expires_at,
        })
    }

    /// Returns the `Authorization` header, refreshing the token first when
    /// the cached one is absent or expired.
    pub async fn to_headers(&self) -> Result<HeaderMap, Error> {
        let mut slot = self.token.lock().await;

        let token = match &*slot {
            Some(token) if token.is_valid() => token.clone(),
            _ => {
                let token = self.request_token().await?;
                *slot = Some(token.clone());
                token
            }
        };

        drop(slot);

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token.value()))
                .expect("Unable to use access token in header value"),
        );

        Ok(headers)
    }
}
