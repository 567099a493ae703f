use crate::primitives::EthHeader;
use alloy_primitives::{B64, B256, Bloom, Bytes, U256, address, b256};
use anyhow::Context;
use rover_protocol::BcNetwork;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

pub const ETH_PROTOCOL_VERSION: u32 = 63;
pub const MAX_BATCH: u64 = 128;
pub const MAX_INVALID_COUNT: u32 = 8;

pub const FORK_PROBE_TIMEOUT: Duration = Duration::from_secs(15);
pub const PEER_MAX_AGE: Duration = Duration::from_secs(600);
/// Delay between a header probe and the follow-up body request.
pub const REQUEST_DELAY: Duration = Duration::from_millis(100);
pub const DPT_BAN_DURATION: Duration = Duration::from_secs(300);

pub const PORT_SCAN_START: u16 = 30304;
pub const PORT_SCAN_END: u16 = 33663;

pub const BLOCK_CACHE_SIZE: usize = 118;
pub const TX_CACHE_SIZE: usize = 2000;

/// Height of the DAO hard-fork block used to tell ETH peers from ETC peers.
pub const DAO_FORK_HEIGHT: u64 = 1_920_000;
pub const DAO_FORK_HASH: B256 =
    b256!("4985f5ca3d2afbec36529aa96f74de3cc10a2a4a6c44f2157a57d2c6059a11bb");

pub const MAINNET_GENESIS_HASH: B256 =
    b256!("d4e56740f876aef8c010b86a09d5855b4224c866c91c24b03e0113d49960d469");
pub const ROPSTEN_GENESIS_HASH: B256 =
    b256!("41941023680923e0fe4d74a34bdac8141f2540e3ae90623718e47d66d1ca4a2d");

const MAINNET_BOOTNODES: &[&str] = &[
    "enode://a979fb575495b8d6db44f750317d0f4622bf4c2aa3365d6af7c284339968eef29b69ad0dce72a4d8db5ebb4968de0e3bec910127f134779fbcb0cb6d3331163c@52.16.188.185:30303",
    "enode://aa36fdf33dd030378a0168efe6ed7d5cc587fafa3cdd375854fe735a2e11ea3650ba29644e2db48368c46e1f60e716300ba49396cd63778bf8a818c09bded46f@13.93.211.84:30303",
    "enode://78de8a0916848093c73790ead81d1928bec737d565119932b98c6b100d944b7a95e94f847f689fc723399d2e31129d182f7ef3863f2b4c820abbf3ab2722344d@191.235.84.50:30303",
    "enode://158f8aab45f6d19c6cbf4a089c2670541a8da11978a2f90dbf6a502a4a3bab80d288afdbeb7ec0ef6d92de563767f3b1ea9e8e334ca711e9f8e2df5a0385e8e6@13.75.154.138:30303",
];

const ROPSTEN_BOOTNODES: &[&str] = &[
    "enode://6ce05930c72abc632c58e2e4324f7c7ea478cec0ed4fa2528982cf34483094e9cbc9216e7aa349691242576d552a2a56aaeae426c5303ded677ce455ba1acd9d@13.84.180.240:30303",
    "enode://20c9ad97c081d63397d7b685a412227a40e23c8bdc6688c6f37e97cfbc22d2b4d1db1510d8f61e6a8866ad7f0e17c02b14182d37ea7c3c8b9c2683aeb6b733a1@52.169.14.227:30303",
];

/// One discovery bootstrap target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: String,
    pub addr: SocketAddr,
}

pub fn parse_enode(raw: &str) -> anyhow::Result<NodeRecord> {
    let url = Url::parse(raw).with_context(|| format!("invalid enode url: {raw}"))?;
    anyhow::ensure!(url.scheme() == "enode", "not an enode url: {raw}");
    let host = url
        .host_str()
        .with_context(|| format!("enode url without host: {raw}"))?;
    let port = url
        .port()
        .with_context(|| format!("enode url without port: {raw}"))?;
    let addr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("enode url with unresolvable host: {raw}"))?;
    Ok(NodeRecord {
        id: url.username().to_string(),
        addr,
    })
}

/// Chain-identity probe ran against every fresh peer. Only mainnet carries
/// one: the DAO fork header is what separates ETH peers from ETC peers,
/// while on ropsten the genesis hash in STATUS is already conclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkCheck {
    pub height: u64,
    pub hash: B256,
}

#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub network_id: u64,
    pub genesis_hash: B256,
    pub genesis_difficulty: U256,
    pub fork_check: Option<ForkCheck>,
    pub bootnodes: Vec<NodeRecord>,
}

impl NetworkParams {
    /// Parameters for the selected network, with configured alt-boot nodes
    /// appended to the chain defaults.
    pub fn for_network(network: BcNetwork, alt_boot_nodes: &[String]) -> anyhow::Result<Self> {
        let (network_id, genesis_hash, genesis_difficulty, fork_check, defaults) = match network {
            BcNetwork::Main => (
                1,
                MAINNET_GENESIS_HASH,
                U256::from(17_179_869_184u64),
                Some(ForkCheck {
                    height: DAO_FORK_HEIGHT,
                    hash: DAO_FORK_HASH,
                }),
                MAINNET_BOOTNODES,
            ),
            BcNetwork::Test => (
                3,
                ROPSTEN_GENESIS_HASH,
                U256::from(1_048_576u64),
                None,
                ROPSTEN_BOOTNODES,
            ),
        };

        let mut bootnodes = defaults
            .iter()
            .map(|raw| parse_enode(raw))
            .collect::<anyhow::Result<Vec<_>>>()?;
        for raw in alt_boot_nodes {
            bootnodes.push(parse_enode(raw)?);
        }

        Ok(Self {
            network_id,
            genesis_hash,
            genesis_difficulty,
            fork_check,
            bootnodes,
        })
    }
}

/// The DAO fork header, kept verbatim so fork probes from other peers can be
/// answered without any local chain state.
pub fn dao_fork_header() -> EthHeader {
    EthHeader {
        parent_hash: b256!("a218e2c611f21232d857e3c8cecdcdf1f65f25a4477f98f6f47e4063807f2308"),
        ommers_hash: b256!("1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347"),
        beneficiary: address!("bcdfc35b86bedf72f0cda046a3c16829a2ef41d1"),
        state_root: b256!("c5e389416116e3696cce82ec4533cce33efccb24ce245ae9546a4b8f0d5e9a75"),
        transactions_root: b256!(
            "7701df8e07169452554d14aadd7bfa256d4a1d0355c1d174ab373e3e2d0a3743"
        ),
        receipts_root: b256!("26cf9d9422e9dd95aedc7914db690b92bab6902f5221d62694a2fa5d065f534b"),
        logs_bloom: Bloom::ZERO,
        difficulty: U256::from(62_413_376_722_602u64),
        number: DAO_FORK_HEIGHT,
        gas_limit: 4_712_384,
        gas_used: 84_000,
        timestamp: 1_469_020_840,
        extra_data: Bytes::from_static(b"dao-hard-fork"),
        mix_hash: b256!("5b5acbf4bf305f948bd7be176047b20623e1417f75597341a059729165b92397"),
        nonce: B64::new([0xbe, 0xde, 0x87, 0x20, 0x1d, 0xe4, 0x24, 0x26]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enode_urls() {
        let record = parse_enode(
            "enode://a979fb575495b8d6db44f750317d0f4622bf4c2aa3365d6af7c284339968eef2@52.16.188.185:30303",
        )
        .unwrap();
        assert_eq!(record.addr, "52.16.188.185:30303".parse().unwrap());
        assert!(record.id.starts_with("a979fb"));
    }

    #[test]
    fn rejects_non_enode_urls() {
        assert!(parse_enode("http://example.com:80").is_err());
        assert!(parse_enode("enode://abc@nohost").is_err());
    }

    #[test]
    fn mainnet_params_carry_fork_check() {
        let params = NetworkParams::for_network(BcNetwork::Main, &[]).unwrap();
        assert_eq!(params.network_id, 1);
        assert_eq!(params.genesis_hash, MAINNET_GENESIS_HASH);
        let check = params.fork_check.unwrap();
        assert_eq!(check.height, DAO_FORK_HEIGHT);
        assert_eq!(check.hash, DAO_FORK_HASH);
        assert!(!params.bootnodes.is_empty());
    }

    #[test]
    fn testnet_skips_fork_check_and_honors_alt_boot_nodes() {
        let alt = vec![
            "enode://ff00@10.0.0.1:30303".to_string(),
        ];
        let params = NetworkParams::for_network(BcNetwork::Test, &alt).unwrap();
        assert_eq!(params.network_id, 3);
        assert!(params.fork_check.is_none());
        assert_eq!(
            params.bootnodes.last().unwrap().addr,
            "10.0.0.1:30303".parse().unwrap()
        );
    }

    #[test]
    fn dao_header_is_the_probe_target() {
        let header = dao_fork_header();
        assert_eq!(header.number, DAO_FORK_HEIGHT);
        assert_eq!(header.extra_data.as_ref(), b"dao-hard-fork");
    }
}
