//! Client for the central server's HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use thinboot_core::error::{Result, ThinbootError};
use thinboot_core::metrics::MetricsSample;
use thinboot_core::wire::{api_base, routes, Credentials};

use crate::session::CredentialSource;

/// Calls the supervisor makes against the server. Every call is
/// best-effort from the caller's point of view.
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Submit a newline-separated batch of log lines.
    async fn post_logs(&self, body: String) -> Result<()>;

    async fn heartbeat(&self, mac: &str) -> Result<()>;

    async fn post_metrics(&self, sample: &MetricsSample) -> Result<()>;

    /// Submit a free-form diagnostic report.
    async fn post_diagnostic(&self, mac: &str, report: String) -> Result<()>;

    /// Exchange a one-time boot token for credentials.
    async fn exchange_token(&self, token: &str) -> Result<Credentials>;
}

/// [`ServerApi`] over HTTP, with one timeout applied to every call.
#[derive(Debug, Clone)]
pub struct HttpServerApi {
    http: reqwest::Client,
    base: String,
}

impl HttpServerApi {
    /// Create a client for `server` (bare address or URL).
    pub fn new(server: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ThinbootError::ApiError {
                endpoint: server.to_string(),
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            http,
            base: api_base(server),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn url(&self, route: &str) -> String {
        format!("{}{}", self.base, route)
    }

    async fn send(&self, route: &str, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await.map_err(|e| ThinbootError::ApiError {
            endpoint: route.to_string(),
            message: if e.is_timeout() {
                "request timed out".to_string()
            } else {
                e.to_string()
            },
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = match status {
                reqwest::StatusCode::NOT_FOUND if route.starts_with("/boot/credentials/") => {
                    "invalid boot token".to_string()
                }
                reqwest::StatusCode::FORBIDDEN => "boot token expired".to_string(),
                _ => format!("server returned {}", status),
            };
            return Err(ThinbootError::ApiError {
                endpoint: route.to_string(),
                message,
            });
        }
        Ok(response)
    }

    /// Fetch the boot instructions served for `mac`.
    pub async fn boot_script(&self, mac: &str) -> Result<String> {
        let route = routes::boot_script(mac);
        let response = self.send(&route, self.http.get(self.url(&route))).await?;
        response.text().await.map_err(|e| ThinbootError::ApiError {
            endpoint: route,
            message: format!("failed to read response: {}", e),
        })
    }
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn post_logs(&self, body: String) -> Result<()> {
        let route = routes::LOG_BATCH;
        let request = self
            .http
            .post(self.url(route))
            .header("Content-Type", "text/plain")
            .body(body);
        let response = self.send(route, request).await?;
        if let Ok(text) = response.text().await {
            tracing::trace!(result = %text.trim(), "Log batch accepted");
        }
        Ok(())
    }

    async fn heartbeat(&self, mac: &str) -> Result<()> {
        let route = routes::heartbeat(mac);
        self.send(&route, self.http.post(self.url(&route))).await?;
        Ok(())
    }

    async fn post_metrics(&self, sample: &MetricsSample) -> Result<()> {
        let route = routes::METRICS;
        self.send(route, self.http.post(self.url(route)).json(sample))
            .await?;
        Ok(())
    }

    async fn post_diagnostic(&self, mac: &str, report: String) -> Result<()> {
        let route = routes::diagnostic(mac);
        let request = self
            .http
            .post(self.url(&route))
            .header("Content-Type", "text/plain")
            .body(report);
        self.send(&route, request).await?;
        Ok(())
    }

    async fn exchange_token(&self, token: &str) -> Result<Credentials> {
        let route = routes::credentials(token);
        let response = self.send(&route, self.http.get(self.url(&route))).await?;
        response
            .json::<Credentials>()
            .await
            .map_err(|e| ThinbootError::ApiError {
                endpoint: route,
                message: format!("malformed credentials: {}", e),
            })
    }
}

#[async_trait]
impl CredentialSource for HttpServerApi {
    async fn exchange(&self, token: &str) -> Result<Credentials> {
        self.exchange_token(token).await
    }
}
