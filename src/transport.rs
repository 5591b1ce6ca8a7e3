//! Network transport seam.
//!
//! The engine never talks to the network directly: the executor calls a
//! [`Transport`]. Applications can supply their own (tests use counting
//! mocks); [`HttpTransport`] is the reqwest-backed production
//! implementation.

use std::future::Future;
use std::pin::Pin;

use reqwest::header::CONTENT_TYPE;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::{HttpMethod, RequestOptions};

/// Boxed future returned by transport calls.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A single network call, supplied by the surrounding application.
///
/// The cancellation token is advisory: the executor already races every call
/// against it and drops the in-flight future on cancellation, but
/// implementations that can cancel at a finer grain may observe it too.
pub trait Transport: Send + Sync + 'static {
    /// Execute an endpoint call, returning the response as JSON.
    fn execute(
        &self,
        endpoint: String,
        options: RequestOptions,
        cancel: CancellationToken,
    ) -> TransportFuture<'_, Value>;

    /// Load a resource as text (documents, encoded image data).
    fn fetch_text(&self, url: String, cancel: CancellationToken) -> TransportFuture<'_, String>;
}

/// HTTP transport backed by reqwest. JSON in and out, optional bearer token
/// kept out of logs via secrecy.
pub struct HttpTransport {
    client: reqwest::Client,
    auth_token: Option<SecretString>,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            auth_token: None,
        }
    }

    pub fn auth_token(mut self, token: SecretString) -> Self {
        self.auth_token = Some(token);
        self
    }

    fn method_for(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }

    async fn send(&self, endpoint: &str, options: &RequestOptions) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .request(Self::method_for(options.method), endpoint)
            .header(CONTENT_TYPE, "application/json");
        for (name, value) in &options.headers {
            request = request.header(name, value);
        }
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }
        if let Some(body) = &options.body {
            request = request.body(body.clone());
        }

        let response = request.send().await.map_err(|e| Error::Network {
            status: None,
            message: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network {
                status: Some(status.as_u16()),
                message: format!("HTTP error, status {status}"),
            });
        }
        Ok(response)
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn execute(
        &self,
        endpoint: String,
        options: RequestOptions,
        _cancel: CancellationToken,
    ) -> TransportFuture<'_, Value> {
        Box::pin(async move {
            let response = self.send(&endpoint, &options).await?;
            response.json::<Value>().await.map_err(|e| Error::Network {
                status: None,
                message: format!("invalid JSON response: {e}"),
            })
        })
    }

    fn fetch_text(&self, url: String, _cancel: CancellationToken) -> TransportFuture<'_, String> {
        Box::pin(async move {
            let response = self.send(&url, &RequestOptions::default()).await?;
            response.text().await.map_err(|e| Error::Network {
                status: None,
                message: format!("failed to read response body: {e}"),
            })
        })
    }
}
