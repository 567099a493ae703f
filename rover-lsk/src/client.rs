use crate::types::{LskBlock, LskTransaction};
use anyhow::Context;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// The API refuses larger pages; batching arithmetic relies on this cap.
pub const LSK_PAGE_LIMIT: u64 = 100;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_HOSTS: &[&str] = &[
    "https://node01.lisk.io/api/",
    "https://node02.lisk.io/api/",
    "https://node03.lisk.io/api/",
];

/// Older nodes wrap the list in `blocks`, newer ones in `data`.
#[derive(Debug, Deserialize)]
struct BlocksEnvelope {
    #[serde(default)]
    blocks: Option<Vec<LskBlock>>,
    #[serde(default)]
    data: Option<Vec<LskBlock>>,
}

impl BlocksEnvelope {
    fn into_blocks(self) -> Vec<LskBlock> {
        self.blocks.or(self.data).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct TransactionsEnvelope {
    #[serde(default)]
    data: Vec<LskTransaction>,
}

/// Rotating HTTPS client over the configured Lisk nodes.
pub struct LskClient {
    http: reqwest::Client,
    hosts: Vec<Url>,
    cursor: AtomicUsize,
}

impl LskClient {
    pub fn new(
        hosts: Vec<String>,
        randomize_nodes: bool,
        banned_peers: &[String],
    ) -> anyhow::Result<Self> {
        let mut hosts: Vec<Url> = hosts
            .iter()
            .filter(|host| !banned_peers.iter().any(|banned| host.contains(banned.as_str())))
            .map(|host| Url::parse(host).with_context(|| format!("invalid lisk host: {host}")))
            .collect::<anyhow::Result<_>>()?;
        anyhow::ensure!(!hosts.is_empty(), "no usable lisk hosts after ban filtering");

        if randomize_nodes {
            use rand::seq::SliceRandom;
            hosts.shuffle(&mut rand::rng());
        }

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("building http client")?;

        Ok(Self {
            http,
            hosts,
            cursor: AtomicUsize::new(0),
        })
    }

    fn next_host(&self) -> &Url {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        &self.hosts[index % self.hosts.len()]
    }

    /// `GET /blocks?limit=&offset=` — offset counts back from the newest
    /// block, page limit capped by the API.
    pub async fn blocks(&self, limit: u64, offset: u64) -> anyhow::Result<Vec<LskBlock>> {
        let host = self.next_host();
        let url = host.join("blocks").context("building blocks url")?;
        debug!(%url, limit, offset, "fetching blocks");
        let envelope: BlocksEnvelope = self
            .http
            .get(url)
            .query(&[("limit", limit.min(LSK_PAGE_LIMIT)), ("offset", offset)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.into_blocks())
    }

    pub async fn latest_block(&self) -> anyhow::Result<Option<LskBlock>> {
        Ok(self.blocks(1, 0).await?.into_iter().next())
    }

    /// `GET /transactions?blockId=`.
    pub async fn transactions(&self, block_id: &str) -> anyhow::Result<Vec<LskTransaction>> {
        let host = self.next_host();
        let url = host.join("transactions").context("building transactions url")?;
        debug!(%url, block_id, "fetching transactions");
        let envelope: TransactionsEnvelope = self
            .http
            .get(url)
            .query(&[("blockId", block_id)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_envelope_accepts_both_shapes() {
        let raw = r#"{"blocks": [{"id": "1", "height": 2, "timestamp": 3, "blockSignature": "s"}]}"#;
        let envelope: BlocksEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.into_blocks().len(), 1);

        let raw = r#"{"data": [{"id": "1", "height": 2, "timestamp": 3, "blockSignature": "s"}]}"#;
        let envelope: BlocksEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.into_blocks().len(), 1);

        let envelope: BlocksEnvelope = serde_json::from_str("{}").unwrap();
        assert!(envelope.into_blocks().is_empty());
    }

    #[test]
    fn banned_hosts_are_filtered() {
        let client = LskClient::new(
            vec![
                "https://node01.lisk.io/api/".to_string(),
                "https://bad.example.com/api/".to_string(),
            ],
            false,
            &["bad.example.com".to_string()],
        )
        .unwrap();
        assert_eq!(client.hosts.len(), 1);
        assert!(client.hosts[0].as_str().contains("node01"));
    }

    #[test]
    fn banning_every_host_is_an_error() {
        let result = LskClient::new(
            vec!["https://bad.example.com/api/".to_string()],
            false,
            &["bad.example.com".to_string()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn host_rotation_cycles() {
        let client = LskClient::new(
            vec![
                "https://node01.lisk.io/api/".to_string(),
                "https://node02.lisk.io/api/".to_string(),
            ],
            false,
            &[],
        )
        .unwrap();
        let first = client.next_host().as_str().to_string();
        let second = client.next_host().as_str().to_string();
        let third = client.next_host().as_str().to_string();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }
}
