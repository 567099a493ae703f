use crate::marker::{SettlementProbe, TxMarker};
use rover_protocol::{Chain, MarkedTx, UnifiedBlock};

/// Chain-agnostic view of a foreign transaction, as the marker sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignTx {
    pub hash: String,
    pub sender: String,
    pub recipient: String,
    /// Amount in chain-native units, big-endian bytes.
    pub value: Vec<u8>,
    /// Whether the chain classifies this as a plain value transfer.
    pub is_value_transfer: bool,
    /// Chain-native key compared against the designated wallet.
    pub sender_key: String,
}

/// A validated foreign block ready for canonical translation.
///
/// Implementations supply the chain-specific parts: timestamp
/// normalization to unix milliseconds and the merkle-root derivation.
pub trait UnifiedSource: Send + Sync {
    fn hash(&self) -> String;
    fn previous_hash(&self) -> String;
    fn height(&self) -> u64;
    fn timestamp_ms(&self) -> u64;
    fn merkle_root(&self) -> String;
    fn transactions(&self) -> Vec<ForeignTx>;
}

/// Builds the canonical block: marked transactions keep the source order
/// and receive dense indices starting at zero.
pub async fn build_unified(
    chain: Chain,
    source: &(dyn UnifiedSource + Send),
    marker: &TxMarker,
    probe: &dyn SettlementProbe,
) -> UnifiedBlock {
    let height = source.height();
    let mut marked_txs = Vec::new();
    for tx in source.transactions() {
        if let Some(token) = marker.token_for(chain, &tx, probe).await {
            marked_txs.push(MarkedTx {
                chain,
                token,
                from: tx.sender,
                to: tx.recipient,
                value: tx.value,
                block_height: height,
                index: marked_txs.len() as u32,
                tx_hash: tx.hash,
            });
        }
    }
    UnifiedBlock {
        chain,
        hash: source.hash(),
        previous_hash: source.previous_hash(),
        timestamp_ms: source.timestamp_ms(),
        height,
        merkle_root: source.merkle_root(),
        marked_txs,
    }
}
