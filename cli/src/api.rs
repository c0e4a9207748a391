// HTTP client for a running gateway
//
// When `blegate serve` is running, the other CLI commands talk to it over
// its own HTTP API instead of opening the radio a second time.

use anyhow::{Context, Result};
use blegate_core::{ConnectionSummary, DecodedValue, Node};
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;

/// Characters left unescaped in path segments
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

pub struct GatewayClient {
    host: String,
    prefix: String,
    client: Client<HttpConnector>,
}

impl GatewayClient {
    pub fn new(port: u16, prefix: &str) -> Self {
        Self {
            host: format!("127.0.0.1:{}", port),
            prefix: crate::config::normalize_prefix(prefix),
            client: Client::new(),
        }
    }

    /// Check if a gateway is listening
    pub async fn is_available(&self) -> bool {
        tokio::net::TcpStream::connect(&self.host).await.is_ok()
    }

    /// URL of an API route; every segment is percent-encoded.
    pub fn url(&self, segments: &[&str], query: Option<&str>) -> String {
        let mut url = format!("http://{}{}", self.host, self.prefix);
        for segment in segments {
            url.push('/');
            url.extend(utf8_percent_encode(segment, SEGMENT));
        }
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    async fn call<T: DeserializeOwned>(&self, method: Method, url: String) -> Result<T> {
        let req = Request::builder()
            .method(method)
            .uri(&url)
            .body(Body::empty())?;

        let resp = self
            .client
            .request(req)
            .await
            .with_context(|| format!("Failed to reach gateway at {}", self.host))?;
        let status = resp.status();
        let body_bytes = hyper::body::to_bytes(resp.into_body()).await?;

        if status != StatusCode::OK {
            let message: String = serde_json::from_slice(&body_bytes)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body_bytes).into_owned());
            anyhow::bail!("{} ({})", message, status);
        }
        serde_json::from_slice(&body_bytes).context("Unexpected response from gateway")
    }

    pub async fn nodes(&self, connectable_only: bool) -> Result<Vec<Node>> {
        let query = connectable_only.then_some("connectable=1");
        self.call(Method::GET, self.url(&["nodes"], query)).await
    }

    pub async fn read(&self, node: &str, service: &str, item: &str) -> Result<DecodedValue> {
        let url = self.url(
            &["nodes", node, "services", service, "items", item, "value"],
            None,
        );
        self.call(Method::GET, url).await
    }

    pub async fn write(
        &self,
        node: &str,
        service: &str,
        item: &str,
        value: &str,
        no_ack: bool,
    ) -> Result<()> {
        let url = self.url(
            &["nodes", node, "services", service, "items", item, "value", value],
            no_ack.then_some("noresponse=1"),
        );
        let _: String = self.call(Method::PUT, url).await?;
        Ok(())
    }

    pub async fn connections(&self) -> Result<Vec<ConnectionSummary>> {
        self.call(Method::GET, self.url(&["connections"], None)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_encoding() {
        let client = GatewayClient::new(3000, "altapi");
        assert_eq!(
            client.url(&["nodes"], Some("connectable=1")),
            "http://127.0.0.1:3000/altapi/nodes?connectable=1"
        );
        assert_eq!(
            client.url(&["nodes", "C0:AB:2A:6A:1A:89", "value", "~hi there"], None),
            "http://127.0.0.1:3000/altapi/nodes/C0%3AAB%3A2A%3A6A%3A1A%3A89/value/%7Ehi%20there"
        );
        assert_eq!(
            client.url(&["value", ".2.-5"], None),
            "http://127.0.0.1:3000/altapi/value/.2.-5"
        );
    }

    #[test]
    fn test_empty_prefix() {
        let client = GatewayClient::new(8080, "/");
        assert_eq!(client.url(&["connections"], None), "http://127.0.0.1:8080/connections");
    }

    #[tokio::test]
    async fn test_unreachable_gateway() {
        // Port 9 (discard) is not expected to have an HTTP listener.
        let client = GatewayClient::new(9, "/altapi");
        assert!(client.nodes(false).await.is_err());
    }
}
