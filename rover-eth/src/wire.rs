use crate::primitives::{EthBlock, EthBlockBody, EthHeader, EthTransaction};
use alloy_primitives::{B256, Bytes, U256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use thiserror::Error;

/// eth/62-63 message codes, relative to the subprotocol offset.
pub mod code {
    pub const STATUS: u8 = 0x00;
    pub const NEW_BLOCK_HASHES: u8 = 0x01;
    pub const TRANSACTIONS: u8 = 0x02;
    pub const GET_BLOCK_HEADERS: u8 = 0x03;
    pub const BLOCK_HEADERS: u8 = 0x04;
    pub const GET_BLOCK_BODIES: u8 = 0x05;
    pub const BLOCK_BODIES: u8 = 0x06;
    pub const NEW_BLOCK: u8 = 0x07;
    pub const GET_NODE_DATA: u8 = 0x0d;
    pub const NODE_DATA: u8 = 0x0e;
    pub const GET_RECEIPTS: u8 = 0x0f;
    pub const RECEIPTS: u8 = 0x10;
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unknown message code {0:#04x}")]
    UnknownCode(u8),
    #[error("rlp decode failed: {0}")]
    Rlp(#[from] alloy_rlp::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct StatusMessage {
    pub protocol_version: u32,
    pub network_id: u64,
    pub total_difficulty: U256,
    pub best_hash: B256,
    pub genesis_hash: B256,
}

/// GET_BLOCK_HEADERS origin: either a concrete hash or a height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrNumber {
    Hash(B256),
    Number(u64),
}

impl Encodable for HashOrNumber {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        match self {
            HashOrNumber::Hash(hash) => hash.encode(out),
            HashOrNumber::Number(number) => number.encode(out),
        }
    }

    fn length(&self) -> usize {
        match self {
            HashOrNumber::Hash(hash) => hash.length(),
            HashOrNumber::Number(number) => number.length(),
        }
    }
}

impl Decodable for HashOrNumber {
    fn decode(buf: &mut &[u8]) -> Result<Self, alloy_rlp::Error> {
        let mut peek = *buf;
        let header = alloy_rlp::Header::decode(&mut peek)?;
        if !header.list && header.payload_length == 32 {
            Ok(HashOrNumber::Hash(B256::decode(buf)?))
        } else {
            Ok(HashOrNumber::Number(u64::decode(buf)?))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct GetBlockHeaders {
    pub origin: HashOrNumber,
    pub max_headers: u64,
    pub skip: u64,
    pub reverse: bool,
}

/// One NEW_BLOCK_HASHES announcement entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct BlockHashNumber {
    pub hash: B256,
    pub number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct NewBlockPayload {
    pub block: EthBlock,
    pub total_difficulty: U256,
}

/// The ETH subprotocol message set, exhaustively matched by the session.
///
/// NODE_DATA and RECEIPTS (and their request forms) keep their raw payload:
/// the rover ignores their contents but must still accept the frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EthMessage {
    Status(StatusMessage),
    NewBlockHashes(Vec<BlockHashNumber>),
    Transactions(Vec<EthTransaction>),
    GetBlockHeaders(GetBlockHeaders),
    BlockHeaders(Vec<EthHeader>),
    GetBlockBodies(Vec<B256>),
    BlockBodies(Vec<EthBlockBody>),
    NewBlock(NewBlockPayload),
    GetNodeData(Bytes),
    NodeData(Bytes),
    GetReceipts(Bytes),
    Receipts(Bytes),
}

/// RLP of an empty list, the reply for data the rover does not serve.
pub const EMPTY_LIST_PAYLOAD: [u8; 1] = [alloy_rlp::EMPTY_LIST_CODE];

impl EthMessage {
    pub fn code(&self) -> u8 {
        match self {
            EthMessage::Status(_) => code::STATUS,
            EthMessage::NewBlockHashes(_) => code::NEW_BLOCK_HASHES,
            EthMessage::Transactions(_) => code::TRANSACTIONS,
            EthMessage::GetBlockHeaders(_) => code::GET_BLOCK_HEADERS,
            EthMessage::BlockHeaders(_) => code::BLOCK_HEADERS,
            EthMessage::GetBlockBodies(_) => code::GET_BLOCK_BODIES,
            EthMessage::BlockBodies(_) => code::BLOCK_BODIES,
            EthMessage::NewBlock(_) => code::NEW_BLOCK,
            EthMessage::GetNodeData(_) => code::GET_NODE_DATA,
            EthMessage::NodeData(_) => code::NODE_DATA,
            EthMessage::GetReceipts(_) => code::GET_RECEIPTS,
            EthMessage::Receipts(_) => code::RECEIPTS,
        }
    }

    pub fn decode(code: u8, payload: &[u8]) -> Result<Self, WireError> {
        let mut buf = payload;
        let message = match code {
            code::STATUS => EthMessage::Status(StatusMessage::decode(&mut buf)?),
            code::NEW_BLOCK_HASHES => {
                EthMessage::NewBlockHashes(Vec::<BlockHashNumber>::decode(&mut buf)?)
            }
            code::TRANSACTIONS => {
                EthMessage::Transactions(Vec::<EthTransaction>::decode(&mut buf)?)
            }
            code::GET_BLOCK_HEADERS => {
                EthMessage::GetBlockHeaders(GetBlockHeaders::decode(&mut buf)?)
            }
            code::BLOCK_HEADERS => EthMessage::BlockHeaders(Vec::<EthHeader>::decode(&mut buf)?),
            code::GET_BLOCK_BODIES => EthMessage::GetBlockBodies(Vec::<B256>::decode(&mut buf)?),
            code::BLOCK_BODIES => EthMessage::BlockBodies(Vec::<EthBlockBody>::decode(&mut buf)?),
            code::NEW_BLOCK => EthMessage::NewBlock(NewBlockPayload::decode(&mut buf)?),
            code::GET_NODE_DATA => EthMessage::GetNodeData(Bytes::copy_from_slice(payload)),
            code::NODE_DATA => EthMessage::NodeData(Bytes::copy_from_slice(payload)),
            code::GET_RECEIPTS => EthMessage::GetReceipts(Bytes::copy_from_slice(payload)),
            code::RECEIPTS => EthMessage::Receipts(Bytes::copy_from_slice(payload)),
            other => return Err(WireError::UnknownCode(other)),
        };
        Ok(message)
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            EthMessage::Status(status) => alloy_rlp::encode(status),
            EthMessage::NewBlockHashes(entries) => alloy_rlp::encode(entries),
            EthMessage::Transactions(txs) => alloy_rlp::encode(txs),
            EthMessage::GetBlockHeaders(request) => alloy_rlp::encode(request),
            EthMessage::BlockHeaders(headers) => alloy_rlp::encode(headers),
            EthMessage::GetBlockBodies(hashes) => alloy_rlp::encode(hashes),
            EthMessage::BlockBodies(bodies) => alloy_rlp::encode(bodies),
            EthMessage::NewBlock(payload) => alloy_rlp::encode(payload),
            EthMessage::GetNodeData(raw)
            | EthMessage::NodeData(raw)
            | EthMessage::GetReceipts(raw)
            | EthMessage::Receipts(raw) => raw.to_vec(),
        }
    }
}

/// Reasons a session ends, mirroring the devp2p disconnect vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Deliberate local disconnect, e.g. the peer refresh cycle.
    DisconnectRequested,
    /// Peer failed chain-identity or integrity checks.
    UselessPeer,
    /// Peer sent undecodable frames; also earns a discovery ban.
    ProtocolBreach,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::DisconnectRequested => f.write_str("disconnect requested"),
            DisconnectReason::UselessPeer => f.write_str("useless peer"),
            DisconnectReason::ProtocolBreach => f.write_str("protocol breach"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::b256;

    #[test]
    fn status_round_trips() {
        let status = StatusMessage {
            protocol_version: 63,
            network_id: 1,
            total_difficulty: U256::from(17_179_869_184u64),
            best_hash: b256!("00000000000000000000000000000000000000000000000000000000000000aa"),
            genesis_hash: crate::params::MAINNET_GENESIS_HASH,
        };
        let message = EthMessage::Status(status.clone());
        let decoded = EthMessage::decode(message.code(), &message.encode_payload()).unwrap();
        assert_eq!(decoded, EthMessage::Status(status));
    }

    #[test]
    fn get_block_headers_origin_shapes() {
        let by_number = GetBlockHeaders {
            origin: HashOrNumber::Number(1_920_000),
            max_headers: 1,
            skip: 0,
            reverse: false,
        };
        let encoded = alloy_rlp::encode(&by_number);
        assert_eq!(
            alloy_rlp::decode_exact::<GetBlockHeaders>(&encoded).unwrap(),
            by_number
        );

        let by_hash = GetBlockHeaders {
            origin: HashOrNumber::Hash(crate::params::DAO_FORK_HASH),
            max_headers: 1,
            skip: 0,
            reverse: false,
        };
        let encoded = alloy_rlp::encode(&by_hash);
        assert_eq!(
            alloy_rlp::decode_exact::<GetBlockHeaders>(&encoded).unwrap(),
            by_hash
        );
    }

    #[test]
    fn new_block_hashes_round_trip() {
        let entries = vec![
            BlockHashNumber {
                hash: b256!("00000000000000000000000000000000000000000000000000000000000000aa"),
                number: 7,
            },
            BlockHashNumber {
                hash: b256!("00000000000000000000000000000000000000000000000000000000000000bb"),
                number: 8,
            },
        ];
        let message = EthMessage::NewBlockHashes(entries.clone());
        let decoded = EthMessage::decode(message.code(), &message.encode_payload()).unwrap();
        assert_eq!(decoded, EthMessage::NewBlockHashes(entries));
    }

    #[test]
    fn unknown_code_is_reported() {
        match EthMessage::decode(0x42, &[]) {
            Err(WireError::UnknownCode(0x42)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn receipts_keep_raw_payload() {
        // list-of-lists payload that must not be structurally decoded
        let raw = [0xc2, 0xc1, 0x80];
        let decoded = EthMessage::decode(code::RECEIPTS, &raw).unwrap();
        assert_eq!(decoded, EthMessage::Receipts(Bytes::copy_from_slice(&raw)));
    }
}
