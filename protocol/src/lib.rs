use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Token tag assigned to transactions of the designated asset.
pub const EMB_TOKEN: &str = "emb";

/// Foreign chains a rover can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Eth,
    Lsk,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Eth => "eth",
            Chain::Lsk => "lsk",
        }
    }

    /// Largest block range a single batch may cover on this chain.
    pub fn max_batch(&self) -> u64 {
        match self {
            Chain::Eth => 128,
            Chain::Lsk => 100,
        }
    }

    /// Nominal block production cadence, in seconds.
    pub fn seconds_per_block(&self) -> u64 {
        match self {
            Chain::Eth => 15,
            Chain::Lsk => 10,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown chain tag: {0}")]
pub struct UnknownChain(String);

impl FromStr for Chain {
    type Err = UnknownChain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eth" => Ok(Chain::Eth),
            "lsk" => Ok(Chain::Lsk),
            other => Err(UnknownChain(other.to_string())),
        }
    }
}

/// Which foreign network flavor the rover attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BcNetwork {
    Main,
    Test,
}

impl fmt::Display for BcNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BcNetwork::Main => f.write_str("main"),
            BcNetwork::Test => f.write_str("test"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown network: {0} (expected `main` or `test`)")]
pub struct UnknownNetwork(String);

impl FromStr for BcNetwork {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(BcNetwork::Main),
            "test" => Ok(BcNetwork::Test),
            other => Err(UnknownNetwork(other.to_string())),
        }
    }
}

/// Inclusive block-height interval requested by the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub from: u64,
    pub to: u64,
}

/// A block the parent already knows about, used to detect stale tips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRef {
    pub height: u64,
    pub hash: String,
    pub timestamp_ms: u64,
}

/// Payload of a REQUEST_RESYNC directive. Empty intervals mean "follow tip".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncDirective {
    #[serde(default)]
    pub intervals: Vec<Interval>,
    #[serde(default)]
    pub latest_known: Option<BlockRef>,
}

/// Directives streamed from the parent coordinator over `rover_join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoverMessage {
    RequestResync(ResyncDirective),
    #[serde(rename_all = "camelCase")]
    FetchBlock {
        current_last: BlockRef,
        previous_last: BlockRef,
    },
}

/// Identity presented when joining the parent's directive stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoverIdent {
    pub chain: Chain,
}

/// A transaction selected for cross-chain relevance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkedTx {
    pub chain: Chain,
    /// Either [`EMB_TOKEN`] or the origin chain tag.
    pub token: String,
    pub from: String,
    pub to: String,
    /// Amount in chain-native units, big-endian bytes.
    pub value: Vec<u8>,
    pub block_height: u64,
    /// Dense position within the block's marked list.
    pub index: u32,
    pub tx_hash: String,
}

/// Canonical cross-chain block representation emitted upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedBlock {
    pub chain: Chain,
    pub hash: String,
    pub previous_hash: String,
    pub timestamp_ms: u64,
    pub height: u64,
    pub merkle_root: String,
    pub marked_txs: Vec<MarkedTx>,
}

/// Terminal report for one resync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoverSyncStatus {
    pub chain: Chain,
    pub ok: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_tag_round_trips() {
        assert_eq!("eth".parse::<Chain>().unwrap(), Chain::Eth);
        assert_eq!("lsk".parse::<Chain>().unwrap(), Chain::Lsk);
        assert_eq!(Chain::Eth.to_string(), "eth");
        assert!("btc".parse::<Chain>().is_err());
    }

    #[test]
    fn request_resync_wire_shape() {
        let raw = r#"{
            "type": "REQUEST_RESYNC",
            "payload": {
                "intervals": [{"from": 1000, "to": 1127}],
                "latestKnown": {"height": 1127, "hash": "0xab", "timestampMs": 1}
            }
        }"#;
        let msg: RoverMessage = serde_json::from_str(raw).unwrap();
        let RoverMessage::RequestResync(directive) = msg else {
            panic!("wrong variant");
        };
        assert_eq!(directive.intervals, vec![Interval { from: 1000, to: 1127 }]);
        assert_eq!(directive.latest_known.unwrap().height, 1127);
    }

    #[test]
    fn fetch_block_wire_shape() {
        let raw = r#"{
            "type": "FETCH_BLOCK",
            "payload": {
                "currentLast": {"height": 20, "hash": "b", "timestampMs": 2},
                "previousLast": {"height": 10, "hash": "a", "timestampMs": 1}
            }
        }"#;
        let msg: RoverMessage = serde_json::from_str(raw).unwrap();
        let RoverMessage::FetchBlock {
            current_last,
            previous_last,
        } = msg
        else {
            panic!("wrong variant");
        };
        assert_eq!(current_last.height, 20);
        assert_eq!(previous_last.height, 10);
    }

    #[test]
    fn unknown_directive_kind_is_an_error() {
        let raw = r#"{"type": "SELF_DESTRUCT", "payload": {}}"#;
        assert!(serde_json::from_str::<RoverMessage>(raw).is_err());
    }

    #[test]
    fn resync_directive_tolerates_missing_fields() {
        let directive: ResyncDirective = serde_json::from_str("{}").unwrap();
        assert!(directive.intervals.is_empty());
        assert!(directive.latest_known.is_none());
    }
}
