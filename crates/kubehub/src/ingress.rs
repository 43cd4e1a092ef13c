//! Public address lookup for provisioned servers.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::ClusterError;

/// Source of the externally reachable address players connect to.
#[async_trait::async_trait]
pub trait IngressSource: Send + Sync {
    async fn address(&self) -> Result<String, ClusterError>;
}

/// Asks a public IP-echo endpoint; the response body is the address.
pub struct EchoIngress {
    client: reqwest::Client,
    url: String,
}

impl EchoIngress {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build().context("building ingress http client")?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait::async_trait]
impl IngressSource for EchoIngress {
    async fn address(&self) -> Result<String, ClusterError> {
        let t0 = std::time::Instant::now();
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ClusterError::Ingress(format!("GET {}: {}", self.url, e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ClusterError::Ingress(format!("GET {}: status {}", self.url, status)));
        }
        let body = resp.text().await.map_err(|e| ClusterError::Ingress(format!("reading body: {}", e)))?;
        let addr = body.trim();
        addr.parse::<IpAddr>()
            .map_err(|_| ClusterError::Ingress(format!("not an IP address: {:?}", addr)))?;
        info!(addr = %addr, took_ms = %t0.elapsed().as_millis(), "ingress address resolved");
        Ok(addr.to_string())
    }
}

/// Fixed address, for clusters whose entry point is known up front.
pub struct StaticIngress(pub String);

#[async_trait::async_trait]
impl IngressSource for StaticIngress {
    async fn address(&self) -> Result<String, ClusterError> { Ok(self.0.clone()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn trims_echoed_address() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("203.0.113.7\n"))
            .mount(&server)
            .await;
        let ing = EchoIngress::new(format!("{}/", server.uri()), Duration::from_secs(5)).unwrap();
        assert_eq!(ing.address().await.unwrap(), "203.0.113.7");
    }

    #[tokio::test]
    async fn non_success_and_garbage_are_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>hi</html>"))
            .mount(&server)
            .await;

        let down = EchoIngress::new(format!("{}/down", server.uri()), Duration::from_secs(5)).unwrap();
        let e = down.address().await.unwrap_err().to_string();
        assert!(e.contains("503"), "e={}", e);

        let html = EchoIngress::new(format!("{}/html", server.uri()), Duration::from_secs(5)).unwrap();
        assert!(matches!(html.address().await, Err(ClusterError::Ingress(_))));
    }
}
