//! OAuth access tokens for the Sheets API: either handed in directly or
//! minted from a service account key with the JWT bearer grant.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::sheets::StoreError;
use crate::HttpFetcher;

pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME: i64 = 3600;
const REFRESH_MARGIN: i64 = 60;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The fields of a service account key file that token minting needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl ServiceAccountKey {
    pub fn from_json(text: &str) -> Result<Self, StoreError> {
        serde_json::from_str(text)
            .map_err(|e| StoreError::Config(format!("invalid service account key: {e}")))
    }

    /// RS256-signed assertion requesting the spreadsheets scope, valid for one hour.
    pub fn signed_assertion(&self, now: DateTime<Utc>) -> Result<String, StoreError> {
        let claims = AssertionClaims {
            iss: self.client_email.clone(),
            scope: SHEETS_SCOPE.to_string(),
            aud: self.token_uri.clone(),
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME,
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .map_err(|e| StoreError::Config(format!("unreadable service account private key: {e}")))?;
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| StoreError::Auth(format!("signing token assertion: {e}")))
    }
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

pub enum TokenSource {
    Static(String),
    ServiceAccount {
        key: ServiceAccountKey,
        cached: Mutex<Option<CachedToken>>,
    },
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(_) => f.write_str("TokenSource::Static(..)"),
            Self::ServiceAccount { key, .. } => f
                .debug_struct("TokenSource::ServiceAccount")
                .field("client_email", &key.client_email)
                .finish_non_exhaustive(),
        }
    }
}

impl TokenSource {
    pub fn service_account(key: ServiceAccountKey) -> Self {
        Self::ServiceAccount {
            key,
            cached: Mutex::new(None),
        }
    }

    /// Current bearer token. Minted tokens are reused until shortly before expiry.
    pub async fn access_token(&self, http: &HttpFetcher) -> Result<String, StoreError> {
        let (key, cached) = match self {
            Self::Static(token) => return Ok(token.clone()),
            Self::ServiceAccount { key, cached } => (key, cached),
        };

        let mut cached = cached.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref() {
            if token.expires_at - Duration::seconds(REFRESH_MARGIN) > now {
                return Ok(token.value.clone());
            }
        }

        let assertion = key.signed_assertion(now)?;
        let resp = http
            .execute(&key.token_uri, |client| {
                client
                    .post(&key.token_uri)
                    .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            })
            .await
            .map_err(|err| match err.status() {
                Some(400) | Some(401) | Some(403) => StoreError::Auth(err.to_string()),
                _ => StoreError::Request(err),
            })?;
        let token: TokenResponse = serde_json::from_slice(&resp.body)
            .map_err(|e| StoreError::Decode(format!("token response: {e}")))?;

        let lifetime = token.expires_in.unwrap_or(ASSERTION_LIFETIME);
        info!(client_email = %key.client_email, lifetime, "minted sheets access token");
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: now + Duration::seconds(lifetime),
        });
        debug!("access token cached");
        Ok(token.access_token)
    }
}
