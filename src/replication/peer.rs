//! HTTP client for node-to-node requests

use crate::common::{Error, Result};
use crate::replication::protocol::{PeerRequestKind, VersionResponse};
use crate::store::{Dataset, Node};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Talks to the node listener of another instance
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
}

impl PeerClient {
    /// Every request is bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { http })
    }

    fn url(addr: &str, kind: PeerRequestKind) -> String {
        format!("http://{}/node/req/{}", addr, kind)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        addr: &str,
        kind: PeerRequestKind,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::FORBIDDEN => Error::NotMaster(addr.to_string()),
                _ => Error::Http(format!("{} {} returned {}: {}", addr, kind, status, body)),
            });
        }
        Ok(response.json::<T>().await?)
    }

    /// Data version of the node at `addr`
    pub async fn fetch_version(&self, addr: &str) -> Result<VersionResponse> {
        let kind = PeerRequestKind::Version;
        let request = self.http.post(Self::url(addr, kind));
        self.send(addr, kind, request).await
    }

    /// Full dataset of the node at `addr`
    pub async fn pull(&self, addr: &str) -> Result<Dataset> {
        let kind = PeerRequestKind::Pull;
        let request = self.http.post(Self::url(addr, kind));
        self.send(addr, kind, request).await
    }

    /// Register `node` with the master at `addr`
    pub async fn register(&self, addr: &str, node: &Node) -> Result<Node> {
        let kind = PeerRequestKind::Register;
        let request = self.http.post(Self::url(addr, kind)).json(node);
        self.send(addr, kind, request).await
    }
}
