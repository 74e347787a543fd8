use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Response, StatusCode, Url};
use ring::{digest, hmac};

use super::{join_key, uri_encode, HttpTimeouts, ImageStore, StoreError};
use crate::object::StoreObject;
use crate::path_mapper::PathMapper;

/// SHA-256 of the empty payload, used for GET/HEAD/DELETE.
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
const SERVICE: &str = "s3";

/// Static AWS credentials.
#[derive(Clone)]
pub struct S3Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl S3Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// Amazon S3 (or S3-compatible) image store using path-style addressing.
pub struct S3Store {
    bucket: String,
    root: String,
    region: String,
    endpoint: String,
    credentials: S3Credentials,
    mapper: PathMapper,
    client: Client,
}

impl S3Store {
    pub fn new(
        bucket: &str,
        root: &str,
        region: &str,
        credentials: S3Credentials,
        mapper: PathMapper,
    ) -> Result<Self, anyhow::Error> {
        let client = HttpTimeouts::default().client()?;

        Ok(Self {
            bucket: bucket.to_string(),
            root: root.to_string(),
            region: region.to_string(),
            endpoint: format!("https://s3.{region}.amazonaws.com"),
            credentials,
            mapper,
            client,
        })
    }

    /// Use a custom endpoint, e.g. MinIO or another S3-compatible service.
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self, anyhow::Error> {
        let parsed = Url::parse(endpoint)?;
        if parsed.cannot_be_a_base() || parsed.host_str().is_none() {
            anyhow::bail!("S3 endpoint must be an http(s) base URL: {endpoint}");
        }
        self.endpoint = endpoint.trim_end_matches('/').to_string();
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

    fn object_url(&self, key: &str) -> Result<Url, anyhow::Error> {
        Ok(Url::parse(&format!(
            "{}/{}/{}",
            self.endpoint,
            self.bucket,
            uri_encode(key)
        ))?)
    }

    /// Send a signed request for `key`.
    async fn request(
        &self,
        method: Method,
        key: &str,
        body: Option<(Bytes, &str)>,
    ) -> Result<Response, anyhow::Error> {
        let url = self.object_url(key)?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => anyhow::bail!("S3 URL has no host: {url}"),
        };

        let payload_hash = match &body {
            Some((data, _)) => hex::encode(digest::digest(&digest::SHA256, data)),
            None => EMPTY_PAYLOAD_SHA256.to_string(),
        };
        let now = Utc::now();

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), host);
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        headers.insert("x-amz-date".to_string(), amz_date(&now));
        if let Some((_, content_type)) = &body {
            headers.insert("content-type".to_string(), content_type.to_string());
        }
        if let Some(token) = &self.credentials.session_token {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }

        let signer = Signer {
            credentials: &self.credentials,
            region: &self.region,
        };
        let authorization =
            signer.authorization(method.as_str(), url.path(), "", &headers, &payload_hash, &now);

        let mut req = self
            .client
            .request(method, url)
            .header("Authorization", authorization);
        for (name, value) in &headers {
            // reqwest derives Host from the URL
            if name != "host" {
                req = req.header(name.as_str(), value.as_str());
            }
        }
        if let Some((data, _)) = body {
            req = req.body(data);
        }

        Ok(req.send().await?)
    }

    async fn head(&self, key: &str) -> Result<bool, StoreError> {
        let resp = self
            .request(Method::HEAD, key, None)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(StoreError::Query(format!(
                "S3 HEAD of {key} failed ({status})"
            ))),
        }
    }
}

#[async_trait]
impl ImageStore for S3Store {
    async fn save(&self, object: &StoreObject, data: Bytes) -> Result<String, StoreError> {
        let key = self.object_key(object.name());
        let resp = self
            .request(Method::PUT, &key, Some((data, object.mime_type())))
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Write(format!(
                "S3 upload of {key} failed ({status}): {body}"
            )));
        }

        tracing::debug!(
            bucket = %self.bucket,
            key = %key,
            mime_type = object.mime_type(),
            "Saved object to S3"
        );
        Ok(self.url_for(object.name()))
    }

    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        self.head(&self.object_key(name)).await
    }

    async fn get(&self, name: &str) -> Result<Bytes, StoreError> {
        let key = self.object_key(name);
        let resp = self
            .request(Method::GET, &key, None)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(name.to_string()));
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Query(format!(
                "S3 download of {key} failed ({status}): {body}"
            )));
        }

        resp.bytes()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    /// S3 DELETE succeeds for absent keys, so presence is checked first.
    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let key = self.object_key(name);
        if !self.head(&key).await? {
            return Err(StoreError::NotFound(name.to_string()));
        }

        let resp = self
            .request(Method::DELETE, &key, None)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Write(format!(
                "S3 delete of {key} failed ({status}): {body}"
            )));
        }

        Ok(())
    }

    fn url_for(&self, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint,
            self.bucket,
            uri_encode(&self.object_key(name))
        )
    }
}

/// AWS Signature Version 4 for the S3 service.
struct Signer<'a> {
    credentials: &'a S3Credentials,
    region: &'a str,
}

impl Signer<'_> {
    /// `headers` must be keyed by lowercase header name.
    fn authorization(
        &self,
        method: &str,
        canonical_uri: &str,
        canonical_query: &str,
        headers: &BTreeMap<String, String>,
        payload_hash: &str,
        now: &DateTime<Utc>,
    ) -> String {
        let signed_headers = signed_headers(headers);
        let signature = self.signature(
            method,
            canonical_uri,
            canonical_query,
            headers,
            payload_hash,
            now,
        );
        format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={signed_headers}, Signature={signature}",
            self.credentials.access_key_id,
            self.scope(now)
        )
    }

    fn signature(
        &self,
        method: &str,
        canonical_uri: &str,
        canonical_query: &str,
        headers: &BTreeMap<String, String>,
        payload_hash: &str,
        now: &DateTime<Utc>,
    ) -> String {
        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{}\n", value.trim()))
            .collect();
        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{}\n{payload_hash}",
            signed_headers(headers)
        );

        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date(now),
            self.scope(now),
            hex::encode(digest::digest(&digest::SHA256, canonical_request.as_bytes()))
        );

        let date = now.format("%Y%m%d").to_string();
        let secret = format!("AWS4{}", self.credentials.secret_access_key);
        let k_date = hmac_sha256(secret.as_bytes(), date.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");

        hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()))
    }

    fn scope(&self, now: &DateTime<Utc>) -> String {
        format!("{}/{}/{SERVICE}/aws4_request", now.format("%Y%m%d"), self.region)
    }
}

fn signed_headers(headers: &BTreeMap<String, String>) -> String {
    headers.keys().map(String::as_str).collect::<Vec<_>>().join(";")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

fn amz_date(now: &DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%SZ").to_string()
}
