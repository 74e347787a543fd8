use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;

use super::{join_key, uri_encode, HttpTimeouts, ImageStore, StoreError};
use crate::object::StoreObject;
use crate::path_mapper::PathMapper;

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
/// Tokens this close to expiry are refreshed before use.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// How the GCS store obtains OAuth access tokens.
#[derive(Clone)]
pub enum GcsAuth {
    /// Self-signed JWT exchanged at the key's token URI.
    ServiceAccount(ServiceAccountKey),
    /// GCE/GKE metadata server (application default credentials).
    MetadataServer,
    /// Fixed bearer token, for emulators and tests.
    StaticToken(String),
}

impl GcsAuth {
    /// Parse a service account JSON key. The private key must decode to a
    /// usable RSA key, so a broken key file fails here rather than on the
    /// first token fetch.
    pub fn service_account_from_json(json: &str) -> Result<Self, anyhow::Error> {
        let key: ServiceAccountKey = serde_json::from_str(json)?;
        rsa_key_pair(&key.private_key)?;
        Ok(GcsAuth::ServiceAccount(key))
    }
}

impl std::fmt::Debug for GcsAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GcsAuth::ServiceAccount(key) => f
                .debug_tuple("ServiceAccount")
                .field(&key.client_email)
                .finish(),
            GcsAuth::MetadataServer => f.write_str("MetadataServer"),
            GcsAuth::StaticToken(_) => f.write_str("StaticToken(..)"),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    value: String,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() + TOKEN_EXPIRY_MARGIN < at,
            None => true,
        }
    }
}

/// Google Cloud Storage image store.
pub struct GcsStore {
    bucket: String,
    root: String,
    mapper: PathMapper,
    client: Client,
    endpoint: Url,
    auth: GcsAuth,
    access_token: tokio::sync::RwLock<Option<CachedToken>>,
}

impl GcsStore {
    /// Tokens are fetched lazily on first use, so construction does no I/O.
    pub fn new(
        bucket: &str,
        root: &str,
        auth: GcsAuth,
        mapper: PathMapper,
    ) -> Result<Self, anyhow::Error> {
        let client = HttpTimeouts::default().client()?;

        let access_token = match &auth {
            GcsAuth::StaticToken(token) => Some(CachedToken {
                value: token.clone(),
                expires_at: None,
            }),
            _ => None,
        };

        Ok(Self {
            bucket: bucket.to_string(),
            root: root.to_string(),
            mapper,
            client,
            endpoint: Url::parse(DEFAULT_ENDPOINT)?,
            auth,
            access_token: tokio::sync::RwLock::new(access_token),
        })
    }

    /// Point the store at a different API host, e.g. a storage emulator.
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self, anyhow::Error> {
        let endpoint = Url::parse(endpoint)?;
        if endpoint.cannot_be_a_base() {
            anyhow::bail!("GCS endpoint must be an http(s) base URL: {endpoint}");
        }
        self.endpoint = endpoint;
        Ok(self)
    }

    pub fn with_timeouts(mut self, timeouts: HttpTimeouts) -> Result<Self, anyhow::Error> {
        self.client = timeouts.client()?;
        Ok(self)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_key(&self, name: &str) -> String {
        join_key(&self.root, &self.mapper.map(name))
    }

    async fn token(&self) -> Result<String, anyhow::Error> {
        if let Some(token) = self.access_token.read().await.as_ref() {
            if token.is_fresh() {
                return Ok(token.value.clone());
            }
        }

        let mut lock = self.access_token.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(token) = lock.as_ref() {
            if token.is_fresh() {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.fetch_token().await?;
        let value = fresh.value.clone();
        *lock = Some(fresh);
        tracing::debug!(bucket = %self.bucket, "Refreshed GCS access token");
        Ok(value)
    }

    async fn fetch_token(&self) -> Result<CachedToken, anyhow::Error> {
        let resp = match &self.auth {
            GcsAuth::ServiceAccount(key) => self.token_from_service_account(key).await?,
            GcsAuth::MetadataServer => self.token_from_metadata_server().await?,
            GcsAuth::StaticToken(token) => {
                return Ok(CachedToken {
                    value: token.clone(),
                    expires_at: None,
                })
            }
        };

        Ok(CachedToken {
            value: resp.access_token,
            expires_at: Some(Instant::now() + Duration::from_secs(resp.expires_in)),
        })
    }

    async fn token_from_service_account(
        &self,
        key: &ServiceAccountKey,
    ) -> Result<TokenResponse, anyhow::Error> {
        let now = chrono::Utc::now().timestamp();
        let claims = serde_json::json!({
            "iss": key.client_email,
            "scope": "https://www.googleapis.com/auth/devstorage.read_write",
            "aud": key.token_uri,
            "iat": now,
            "exp": now + 3600,
        });

        // Build JWT (header.claims.signature)
        let header = base64_url_encode(&serde_json::to_vec(&serde_json::json!({
            "alg": "RS256",
            "typ": "JWT"
        }))?);
        let payload = base64_url_encode(&serde_json::to_vec(&claims)?);
        let unsigned = format!("{header}.{payload}");

        let signature = sign_rs256(unsigned.as_bytes(), &key.private_key)?;
        let jwt = format!("{unsigned}.{}", base64_url_encode(&signature));

        let resp: TokenResponse = self
            .client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &jwt),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp)
    }

    async fn token_from_metadata_server(&self) -> Result<TokenResponse, anyhow::Error> {
        let resp: TokenResponse = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp)
    }

    fn api_url(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        // cannot_be_a_base endpoints are rejected at construction.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn upload_url(&self, key: &str) -> Url {
        let mut url = self.api_url(&["upload", "storage", "v1", "b", &self.bucket, "o"]);
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", key);
        url
    }

    fn object_url(&self, key: &str) -> Url {
        let mut url = self.metadata_url(key);
        url.query_pairs_mut().append_pair("alt", "media");
        url
    }

    fn metadata_url(&self, key: &str) -> Url {
        self.api_url(&["storage", "v1", "b", &self.bucket, "o", key])
    }
}

#[async_trait]
impl ImageStore for GcsStore {
    async fn save(&self, object: &StoreObject, data: Bytes) -> Result<String, StoreError> {
        let key = self.object_key(object.name());
        let token = self
            .token()
            .await
            .map_err(|e| StoreError::Write(format!("GCS auth failed: {e}")))?;

        let resp = self
            .client
            .post(self.upload_url(&key))
            .bearer_auth(&token)
            .header("Content-Type", object.mime_type())
            .body(data)
            .send()
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Write(format!(
                "GCS upload of {key} failed ({status}): {body}"
            )));
        }

        tracing::debug!(
            bucket = %self.bucket,
            key = %key,
            mime_type = object.mime_type(),
            "Saved object to GCS"
        );
        Ok(self.url_for(object.name()))
    }

    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        let key = self.object_key(name);
        let token = self
            .token()
            .await
            .map_err(|e| StoreError::Query(format!("GCS auth failed: {e}")))?;

        let resp = self
            .client
            .get(self.metadata_url(&key))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(StoreError::Query(format!(
                    "GCS metadata lookup of {key} failed ({status}): {body}"
                )))
            }
        }
    }

    async fn get(&self, name: &str) -> Result<Bytes, StoreError> {
        let key = self.object_key(name);
        let token = self
            .token()
            .await
            .map_err(|e| StoreError::Query(format!("GCS auth failed: {e}")))?;

        let resp = self
            .client
            .get(self.object_url(&key))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(name.to_string()));
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Query(format!(
                "GCS download of {key} failed ({status}): {body}"
            )));
        }

        resp.bytes()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let key = self.object_key(name);
        let token = self
            .token()
            .await
            .map_err(|e| StoreError::Write(format!("GCS auth failed: {e}")))?;

        let resp = self
            .client
            .delete(self.metadata_url(&key))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(name.to_string()));
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Write(format!(
                "GCS delete of {key} failed ({status}): {body}"
            )));
        }

        Ok(())
    }

    fn url_for(&self, name: &str) -> String {
        let base = self.endpoint.as_str().trim_end_matches('/');
        format!(
            "{base}/{}/{}",
            uri_encode(&self.bucket),
            uri_encode(&self.object_key(name))
        )
    }
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn rsa_key_pair(private_key_pem: &str) -> Result<ring::signature::RsaKeyPair, anyhow::Error> {
    // Strip PEM armour and decode the PKCS#8 DER body
    let der_b64: String = private_key_pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .map(str::trim)
        .collect();
    let der = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &der_b64)?;

    ring::signature::RsaKeyPair::from_pkcs8(&der)
        .map_err(|e| anyhow::anyhow!("Failed to parse RSA key: {e}"))
}

fn sign_rs256(data: &[u8], private_key_pem: &str) -> Result<Vec<u8>, anyhow::Error> {
    let key_pair = rsa_key_pair(private_key_pem)?;

    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(
            &ring::signature::RSA_PKCS1_SHA256,
            &ring::rand::SystemRandom::new(),
            data,
            &mut signature,
        )
        .map_err(|e| anyhow::anyhow!("Failed to sign: {e}"))?;

    Ok(signature)
}
