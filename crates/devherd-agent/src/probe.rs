use std::{sync::Arc, time::Duration};

use anyhow::Context;

use crate::settings::Timings;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("timed out")]
    Timeout,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("http error: {0}")]
    Http(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// Network access to `127.0.0.1`, the only host the engine ever probes.
#[async_trait::async_trait]
pub trait LoopbackClient: Send + Sync {
    /// GET and report the status only; the body is not read.
    async fn status(&self, port: u16, path: &str, timeout: Duration) -> Result<u16, ProbeError>;
    async fn text(&self, port: u16, path: &str, timeout: Duration)
    -> Result<HttpReply, ProbeError>;
    async fn connect(&self, port: u16, timeout: Duration) -> bool;
}

#[derive(Debug, Clone)]
pub struct ReqwestLoopback {
    client: reqwest::Client,
}

impl ReqwestLoopback {
    pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(connect_timeout)
            .build()
            .context("build loopback http client")?;
        Ok(Self { client })
    }

    async fn send(
        &self,
        port: u16,
        path: &str,
        timeout: Duration,
    ) -> Result<reqwest::Response, ProbeError> {
        let url = format!("http://127.0.0.1:{port}{path}");
        self.client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest_error)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout
    } else if e.is_connect() {
        ProbeError::Connect(e.to_string())
    } else {
        ProbeError::Http(e.to_string())
    }
}

#[async_trait::async_trait]
impl LoopbackClient for ReqwestLoopback {
    async fn status(&self, port: u16, path: &str, timeout: Duration) -> Result<u16, ProbeError> {
        Ok(self.send(port, path, timeout).await?.status().as_u16())
    }

    async fn text(
        &self,
        port: u16,
        path: &str,
        timeout: Duration,
    ) -> Result<HttpReply, ProbeError> {
        let resp = self.send(port, path, timeout).await?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(map_reqwest_error)?;
        Ok(HttpReply { status, body })
    }

    async fn connect(&self, port: u16, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, tokio::net::TcpStream::connect(("127.0.0.1", port)))
                .await,
            Ok(Ok(_))
        )
    }
}

/// Outcome of a proxy `/health` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyHealth {
    Down,
    /// Answered, but not with a 2xx.
    Status(u16),
    Body(String),
}

/// Liveness checks standing in for process status.
///
/// Every failure reads as "not up"; nothing here returns an error.
#[derive(Clone)]
pub struct HealthProber {
    client: Arc<dyn LoopbackClient>,
    http_timeout: Duration,
    tcp_timeout: Duration,
    log_timeout: Duration,
}

impl HealthProber {
    pub fn new(client: Arc<dyn LoopbackClient>, timings: &Timings) -> Self {
        Self {
            client,
            http_timeout: timings.http_timeout(),
            tcp_timeout: timings.tcp_timeout(),
            log_timeout: timings.log_fetch_timeout(),
        }
    }

    /// Status of `GET /`, if anything answered.
    pub async fn http_status(&self, port: u16) -> Option<u16> {
        match self.client.status(port, "/", self.http_timeout).await {
            Ok(status) => {
                tracing::trace!(port, status, "port responded");
                Some(status)
            }
            Err(_) => None,
        }
    }

    /// An HTTP server that is not itself erroring hard is listening.
    pub async fn is_reachable_http(&self, port: u16) -> bool {
        self.http_status(port)
            .await
            .is_some_and(|status| (200..500).contains(&status))
    }

    /// Raw TCP connect; says nothing about HTTP.
    pub async fn is_port_open(&self, port: u16) -> bool {
        self.client.connect(port, self.tcp_timeout).await
    }

    /// Current content served by a log helper, if it is up.
    pub async fn fetch_log(&self, log_port: u16) -> Option<String> {
        match self.client.text(log_port, "/", self.log_timeout).await {
            Ok(reply) if (200..300).contains(&reply.status) => Some(reply.body),
            Ok(_) | Err(_) => None,
        }
    }

    pub async fn proxy_health(&self, port: u16) -> ProxyHealth {
        match self.client.text(port, "/health", self.http_timeout).await {
            Ok(reply) if (200..300).contains(&reply.status) => ProxyHealth::Body(reply.body),
            Ok(reply) => ProxyHealth::Status(reply.status),
            Err(_) => ProxyHealth::Down,
        }
    }
}
