//! HTTP transport to hardware daemons.
//!
//! Every daemon exposes the same minimal surface: `POST <url>` with a JSON request,
//! `GET <url>` returning a JSON status document, and a few plain-text `GET`
//! endpoints (histograms). [`DaemonTransport`] captures that surface so the request
//! protocol in [`super::daemon`] can be exercised against an in-memory daemon.

use crate::error::{HardwareError, HardwareResult};
use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, Uri};
use serde_json::Value;

/// Raw request/response exchange with a daemon.
#[async_trait]
pub trait DaemonTransport: Send + Sync {
    /// `GET <url>` and decode the body as JSON.
    async fn get_json(&self, url: &str) -> HardwareResult<Value>;

    /// `POST <url>` with a JSON body. The response body is ignored.
    async fn post_json(&self, url: &str, body: &Value) -> HardwareResult<()>;

    /// `GET <url>` and return the body as text.
    async fn get_text(&self, url: &str) -> HardwareResult<String>;
}

/// [`DaemonTransport`] over plain HTTP/1.1.
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: Client<HttpConnector>,
}

impl HttpTransport {
    /// Create a transport with a fresh connection pool.
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    async fn exchange(&self, url: &str, request: Request<Body>) -> HardwareResult<Bytes> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| transport_error(url, e))?;

        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| transport_error(url, e))?;

        if !status.is_success() {
            return Err(HardwareError::Transport {
                url: url.to_string(),
                message: format!("HTTP {}", status),
            });
        }
        Ok(body)
    }

    fn build(url: &str, method: Method, body: Body) -> HardwareResult<Request<Body>> {
        let uri: Uri = url.parse().map_err(|_| HardwareError::InvalidUrl {
            url: url.to_string(),
        })?;
        Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .map_err(|_| HardwareError::InvalidUrl {
                url: url.to_string(),
            })
    }
}

#[async_trait]
impl DaemonTransport for HttpTransport {
    async fn get_json(&self, url: &str) -> HardwareResult<Value> {
        let request = Self::build(url, Method::GET, Body::empty())?;
        let bytes = self.exchange(url, request).await?;
        serde_json::from_slice(&bytes).map_err(|e| HardwareError::InvalidResponse {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    async fn post_json(&self, url: &str, body: &Value) -> HardwareResult<()> {
        let payload = serde_json::to_vec(body).map_err(|e| HardwareError::InvalidResponse {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let request = Self::build(url, Method::POST, Body::from(payload))?;
        self.exchange(url, request).await?;
        Ok(())
    }

    async fn get_text(&self, url: &str) -> HardwareResult<String> {
        let request = Self::build(url, Method::GET, Body::empty())?;
        let bytes = self.exchange(url, request).await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| HardwareError::InvalidResponse {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

fn transport_error(url: &str, err: hyper::Error) -> HardwareError {
    HardwareError::Transport {
        url: url.to_string(),
        message: err.to_string(),
    }
}
