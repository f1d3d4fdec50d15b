//! HTTP client for the remote lifecycle service.
//!
//! Endpoints:
//! - `GET /v1/microvms/{id}` - fetch by UID or name (404 means not found)
//! - `POST /v1/microvms` - create
//! - `DELETE /v1/microvms/{id}` - start deletion
//!
//! `{id}` is percent-encoded as a single path segment.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Response, StatusCode, Url};
use tracing::{debug, error};

use super::{ClientFactory, ClientOptions, CreateRequest, MicrovmClient, RemoteError, RemoteRecord};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds `HttpMicrovmClient`s.
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpClientFactory {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl ClientFactory for HttpClientFactory {
    fn connect(
        &self,
        endpoint: &str,
        options: ClientOptions,
    ) -> Result<Box<dyn MicrovmClient>, RemoteError> {
        Ok(Box::new(HttpMicrovmClient::new(
            endpoint,
            &options,
            self.timeout,
        )?))
    }
}

/// Lifecycle client speaking JSON over HTTP(S).
pub struct HttpMicrovmClient {
    client: reqwest::Client,
    base_url: Url,
    authorization: Option<String>,
}

impl HttpMicrovmClient {
    /// Create a client for `endpoint` (`host:port`).
    ///
    /// TLS material switches the scheme to `https` and enables mutual TLS.
    pub fn new(
        endpoint: &str,
        options: &ClientOptions,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);

        if let Some(proxy) = &options.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| RemoteError::InvalidConfig(format!("proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let scheme = match &options.tls {
            Some(tls) => {
                let ca = reqwest::Certificate::from_pem(tls.ca_pem.as_bytes())
                    .map_err(|e| RemoteError::InvalidConfig(format!("CA certificate: {e}")))?;
                let identity_pem = format!("{}\n{}", tls.cert_pem, tls.key_pem);
                let identity = reqwest::Identity::from_pem(identity_pem.as_bytes())
                    .map_err(|e| RemoteError::InvalidConfig(format!("client identity: {e}")))?;
                builder = builder
                    .use_rustls_tls()
                    .add_root_certificate(ca)
                    .identity(identity);
                "https"
            }
            None => "http",
        };

        let client = builder
            .build()
            .map_err(|e| RemoteError::InvalidConfig(format!("building HTTP client: {e}")))?;

        let base_url = Url::parse(&format!("{scheme}://{endpoint}"))
            .map_err(|e| RemoteError::InvalidConfig(format!("endpoint {endpoint}: {e}")))?;

        Ok(Self {
            client,
            base_url,
            authorization: options
                .basic_auth_token
                .as_ref()
                .map(|token| format!("Basic {token}")),
        })
    }

    /// Base URL requests are sent to.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// URL for `segments` under the base URL, each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // http(s) URLs always have a path to extend.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, segments: &[&str]) -> reqwest::RequestBuilder {
        let request = self.client.request(method, self.url(segments));
        match &self.authorization {
            Some(value) => request.header(AUTHORIZATION, value),
            None => request,
        }
    }

    async fn api_error(response: Response, operation: &str) -> RemoteError {
        let status = response.status();
        let message = response.text().await.unwrap_or_default();
        error!(status = %status, body = %message, operation, "Lifecycle API call failed");
        RemoteError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl MicrovmClient for HttpMicrovmClient {
    async fn get(&self, id: &str) -> Result<RemoteRecord, RemoteError> {
        debug!(id, "Fetching microvm");

        let response = self
            .request(reqwest::Method::GET, &["v1", "microvms", id])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response, "get").await);
        }

        Ok(response.json().await?)
    }

    async fn create(&self, request: &CreateRequest) -> Result<RemoteRecord, RemoteError> {
        debug!(id = %request.id, namespace = %request.namespace, "Creating microvm");

        let response = self
            .request(reqwest::Method::POST, &["v1", "microvms"])
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::api_error(response, "create").await);
        }

        Ok(response.json().await?)
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        debug!(id, "Deleting microvm");

        let response = self
            .request(reqwest::Method::DELETE, &["v1", "microvms", id])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response, "delete").await);
        }

        Ok(())
    }

    async fn close(&self) {
        // Connections are pooled by reqwest and released on drop.
        debug!(base_url = %self.base_url, "Closing lifecycle client");
    }
}
