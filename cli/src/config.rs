use rover_protocol::BcNetwork;
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use tracing::level_filters::LevelFilter;

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct RoverConfig {
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_rust_log")]
    pub rust_log: LevelFilter,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_bc_network")]
    pub bc_network: BcNetwork,
    #[serde(default = "default_maximum_peers")]
    pub maximum_peers: usize,
    #[serde(default)]
    pub is_standalone: bool,
    #[serde(default = "default_collector_url")]
    pub rover_collector_url: String,
    #[serde(default)]
    pub eth_designated_pubkey: Option<String>,
    #[serde(default)]
    pub lsk_designated_pubkey: Option<String>,
    #[serde(default)]
    pub eth_alt_boot_nodes: Vec<String>,
    #[serde(default)]
    pub lsk_hosts: Vec<String>,
    #[serde(default = "default_randomize_nodes")]
    pub randomize_nodes: bool,
    #[serde(default)]
    pub banned_peers: Vec<String>,
}

fn default_rust_log() -> LevelFilter {
    LevelFilter::INFO
}

fn default_bc_network() -> BcNetwork {
    BcNetwork::Main
}

fn default_maximum_peers() -> usize {
    25
}

fn default_collector_url() -> String {
    "ws://127.0.0.1:9090".to_string()
}

fn default_randomize_nodes() -> bool {
    true
}

pub fn get_rover_config() -> anyhow::Result<RoverConfig> {
    Ok(envy::from_env::<RoverConfig>()?)
}
