use crate::client::{LSK_PAGE_LIMIT, LskClient};
use crate::types::{LSK_TRANSFER_TYPE, LskBlock, LskTransaction};
use async_trait::async_trait;
use blake2::{Blake2b512, Digest};
use rover_lib::builder::{ForeignTx, UnifiedSource};
use rover_lib::control::{ChainDriver, DispatchOutcome, RoverEvent};
use rover_lib::planner::Batch;
use rover_protocol::Chain;
use std::time::Duration;
use tracing::{debug, warn};

/// Unix seconds of the Lisk genesis instant, 2016-05-24T17:00:00Z.
pub const LSK_GENESIS_UNIX_SECONDS: u64 = 1_464_109_200;

pub fn blake2b_hex(data: &[u8]) -> String {
    let digest = Blake2b512::digest(data);
    faster_hex::hex_string(&digest)
}

fn be_bytes_trimmed(amount: u128) -> Vec<u8> {
    let bytes = amount.to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

/// A Lisk block with its transactions resolved, ready for translation.
pub struct LskSource {
    pub block: LskBlock,
    pub transactions: Vec<LskTransaction>,
}

impl UnifiedSource for LskSource {
    fn hash(&self) -> String {
        self.block.id.clone()
    }

    fn previous_hash(&self) -> String {
        self.block.previous_block.clone().unwrap_or_default()
    }

    fn height(&self) -> u64 {
        self.block.height
    }

    fn timestamp_ms(&self) -> u64 {
        (LSK_GENESIS_UNIX_SECONDS + self.block.timestamp) * 1000
    }

    /// Not a canonical merkle tree: the signature digest for empty blocks,
    /// otherwise a left fold of blake2b over the transaction ids.
    fn merkle_root(&self) -> String {
        if self.transactions.is_empty() {
            return blake2b_hex(self.block.block_signature.as_bytes());
        }
        let mut acc = String::new();
        for tx in &self.transactions {
            let mut buf = Vec::with_capacity(acc.len() + tx.id.len());
            buf.extend_from_slice(acc.as_bytes());
            buf.extend_from_slice(tx.id.as_bytes());
            acc = blake2b_hex(&buf);
        }
        acc
    }

    fn transactions(&self) -> Vec<ForeignTx> {
        self.transactions
            .iter()
            .map(|tx| ForeignTx {
                hash: tx.id.clone(),
                sender: tx.sender_id.clone(),
                recipient: tx.recipient_id.clone().unwrap_or_default(),
                value: be_bytes_trimmed(tx.amount),
                is_value_transfer: tx.kind == LSK_TRANSFER_TYPE,
                sender_key: tx.sender_public_key.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct LskRoverConfig {
    pub hosts: Vec<String>,
    pub randomize_nodes: bool,
    pub banned_peers: Vec<String>,
}

/// Lisk half of the rover: polls the HTTP API for the tip and resolves
/// batch dispatches through offset+limit pagination.
pub struct LskDriver {
    client: LskClient,
    events: flume::Sender<RoverEvent>,
    last_seen_height: Option<u64>,
}

impl LskDriver {
    pub fn new(config: LskRoverConfig, events: flume::Sender<RoverEvent>) -> anyhow::Result<Self> {
        let hosts = if config.hosts.is_empty() {
            crate::client::DEFAULT_HOSTS
                .iter()
                .map(|host| host.to_string())
                .collect()
        } else {
            config.hosts
        };
        let client = LskClient::new(hosts, config.randomize_nodes, &config.banned_peers)?;
        Ok(Self {
            client,
            events,
            last_seen_height: None,
        })
    }

    async fn resolve(&self, block: LskBlock) -> anyhow::Result<LskSource> {
        let transactions = if block.number_of_transactions > 0 {
            self.client.transactions(&block.id).await?
        } else {
            Vec::new()
        };
        Ok(LskSource {
            block,
            transactions,
        })
    }
}

#[async_trait]
impl ChainDriver for LskDriver {
    fn chain(&self) -> Chain {
        Chain::Lsk
    }

    fn tip_height(&self) -> Option<u64> {
        self.last_seen_height
    }

    async fn dispatch(&mut self, batch: Batch) -> anyhow::Result<DispatchOutcome> {
        if self.last_seen_height.is_none() {
            match self.client.latest_block().await? {
                Some(block) => self.last_seen_height = Some(block.height),
                None => return Ok(DispatchOutcome::NotReady),
            }
        }
        let tip = self.last_seen_height.expect("tip resolved above");

        let offset = tip.saturating_sub(batch.to);
        let limit = batch.len().min(LSK_PAGE_LIMIT);
        let blocks = self.client.blocks(limit, offset).await?;
        if blocks.is_empty() {
            warn!(from = batch.from, to = batch.to, "empty page for batch");
            return Ok(DispatchOutcome::NotReady);
        }

        for block in blocks {
            if block.height < batch.from || block.height > batch.to {
                debug!(height = block.height, "page spilled outside batch, dropping");
                continue;
            }
            let source = self.resolve(block).await?;
            self.events
                .send_async(RoverEvent::Block {
                    source: Box::new(source),
                    from_initial_sync: true,
                })
                .await?;
        }
        Ok(DispatchOutcome::Dispatched)
    }

    async fn poll_live(&mut self) -> anyhow::Result<()> {
        let Some(block) = self.client.latest_block().await? else {
            return Ok(());
        };
        if self
            .last_seen_height
            .is_some_and(|height| block.height <= height)
        {
            return Ok(());
        }
        self.last_seen_height = Some(block.height);

        let source = self.resolve(block).await?;
        self.events
            .send_async(RoverEvent::Block {
                source: Box::new(source),
                from_initial_sync: false,
            })
            .await?;
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(Chain::Lsk.seconds_per_block())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rover_lib::builder::build_unified;
    use rover_lib::marker::{NeverSettles, SettlementProbe, TxMarker};
    use rover_protocol::EMB_TOKEN;

    fn block(transactions: u64) -> LskBlock {
        LskBlock {
            id: "10881767460073655903".to_string(),
            height: 8_128_779,
            previous_block: Some("1349213844499460766".to_string()),
            timestamp: 87_022_900,
            payload_hash: String::new(),
            payload_length: 0,
            generator_public_key: "gen".to_string(),
            block_signature: "sig-bytes".to_string(),
            number_of_transactions: transactions,
        }
    }

    fn transfer(id: &str, sender_key: &str) -> LskTransaction {
        LskTransaction {
            id: id.to_string(),
            kind: LSK_TRANSFER_TYPE,
            sender_id: "123L".to_string(),
            sender_public_key: sender_key.to_string(),
            recipient_id: Some("456L".to_string()),
            amount: 100_000_000,
        }
    }

    #[test]
    fn timestamp_is_offset_from_genesis_epoch() {
        let source = LskSource {
            block: block(0),
            transactions: Vec::new(),
        };
        assert_eq!(
            source.timestamp_ms(),
            (LSK_GENESIS_UNIX_SECONDS + 87_022_900) * 1000
        );
    }

    #[test]
    fn empty_block_merkle_root_is_signature_digest() {
        let source = LskSource {
            block: block(0),
            transactions: Vec::new(),
        };
        assert_eq!(source.merkle_root(), blake2b_hex(b"sig-bytes"));
    }

    #[test]
    fn merkle_root_folds_over_transaction_ids() {
        let source = LskSource {
            block: block(3),
            transactions: vec![
                transfer("t1", "k"),
                transfer("t2", "k"),
                transfer("t3", "k"),
            ],
        };
        let step1 = blake2b_hex(b"t1");
        let step2 = blake2b_hex(format!("{step1}t2").as_bytes());
        let step3 = blake2b_hex(format!("{step2}t3").as_bytes());
        assert_eq!(source.merkle_root(), step3);
    }

    #[test]
    fn amounts_become_trimmed_big_endian_bytes() {
        assert_eq!(be_bytes_trimmed(0x0102), vec![0x01, 0x02]);
        assert_eq!(be_bytes_trimmed(0), Vec::<u8>::new());
        let source = LskSource {
            block: block(1),
            transactions: vec![transfer("t1", "k")],
        };
        // 100_000_000 == 0x05F5E100
        assert_eq!(
            source.transactions()[0].value,
            vec![0x05, 0xf5, 0xe1, 0x00]
        );
    }

    #[tokio::test]
    async fn designated_sender_is_marked_emb() {
        let source = LskSource {
            block: block(1),
            transactions: vec![transfer("t1", "designated-key")],
        };
        let marker = TxMarker::new(Some("designated-key".to_string()), false);
        let unified = build_unified(Chain::Lsk, &source, &marker, &NeverSettles).await;
        assert_eq!(unified.marked_txs.len(), 1);
        assert_eq!(unified.marked_txs[0].token, EMB_TOKEN);
        assert_eq!(unified.marked_txs[0].index, 0);
        assert_eq!(unified.marked_txs[0].from, "123L");
        assert_eq!(unified.marked_txs[0].to, "456L");
    }

    #[tokio::test]
    async fn settlement_window_marks_with_lsk_token() {
        struct AlwaysSettles;

        #[async_trait]
        impl SettlementProbe for AlwaysSettles {
            async fn is_before_settle_height(
                &self,
                _from: &str,
                _to: &str,
                _chain: Chain,
            ) -> bool {
                true
            }
        }

        let source = LskSource {
            block: block(1),
            transactions: vec![transfer("t1", "someone-else")],
        };
        let marker = TxMarker::new(Some("designated-key".to_string()), false);
        let unified = build_unified(Chain::Lsk, &source, &marker, &AlwaysSettles).await;
        assert_eq!(unified.marked_txs.len(), 1);
        assert_eq!(unified.marked_txs[0].token, "lsk");
    }

    #[tokio::test]
    async fn unified_block_carries_native_identifiers() {
        let source = LskSource {
            block: block(0),
            transactions: Vec::new(),
        };
        let marker = TxMarker::new(None, true);
        let unified = build_unified(Chain::Lsk, &source, &marker, &NeverSettles).await;
        assert_eq!(unified.chain, Chain::Lsk);
        assert_eq!(unified.hash, "10881767460073655903");
        assert_eq!(unified.previous_hash, "1349213844499460766");
        assert_eq!(unified.height, 8_128_779);
    }
}
