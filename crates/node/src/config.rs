//! Node configuration: explicit records, filled by hand-parsed arguments.

use std::net::SocketAddr;

use mwd_consensus::constants::{
    BAN_WINDOW_SECS, COINBASE_MATURITY, CUT_THROUGH_HORIZON, PROTOCOL_VERSION,
    TXHASHSET_REQUEST_COOLDOWN_SECS, USER_AGENT,
};
use mwd_consensus::params::{chain_params, ChainParams, Network};
use mwd_consensus::Hash256;

/// Everything the P2P layer needs to know, fixed at startup.
#[derive(Clone, Debug)]
pub struct P2PConfig {
    pub network: Network,
    pub p2p_port: u16,
    pub protocol_version: u32,
    pub user_agent: String,
    pub genesis_hash: Hash256,
    /// Send-queue slots per connection; gossip beyond this is dropped.
    pub peer_max_send_queue: usize,
    /// Sustained per-peer message budget.
    pub rate_limit_msgs_per_sec: f64,
    /// Instantaneous per-peer burst allowance.
    pub rate_limit_burst: f64,
    pub tx_hash_set_request_cooldown_secs: u64,
    pub sync_horizon_blocks: u64,
    pub coinbase_maturity: u64,
    pub ban_window_secs: u64,
}

impl P2PConfig {
    pub fn for_network(network: Network, genesis_hash: Hash256) -> Self {
        let params: ChainParams = chain_params(network);
        Self {
            network,
            p2p_port: params.p2p_port,
            protocol_version: PROTOCOL_VERSION,
            user_agent: USER_AGENT.to_string(),
            genesis_hash,
            peer_max_send_queue: 128,
            // 500 msgs/min sustained, 50/s burst.
            rate_limit_msgs_per_sec: 500.0 / 60.0,
            rate_limit_burst: 50.0,
            tx_hash_set_request_cooldown_secs: TXHASHSET_REQUEST_COOLDOWN_SECS,
            sync_horizon_blocks: CUT_THROUGH_HORIZON,
            coinbase_maturity: COINBASE_MATURITY,
            ban_window_secs: BAN_WINDOW_SECS,
        }
    }
}

/// Binary-level options on top of the P2P record.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub network: Network,
    pub listen_port: Option<u16>,
    pub seeds: Vec<SocketAddr>,
    pub outbound_target: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            listen_port: None,
            seeds: Vec::new(),
            outbound_target: 8,
        }
    }
}

pub fn parse_args(args: &[String]) -> Result<NodeConfig, String> {
    let mut config = NodeConfig::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--floonet" => config.network = Network::Floonet,
            "--testnet" => config.network = Network::Testnet,
            "--port" => {
                let value = iter.next().ok_or("--port requires a value")?;
                config.listen_port =
                    Some(value.parse().map_err(|_| format!("bad port {value}"))?);
            }
            "--seed" => {
                let value = iter.next().ok_or("--seed requires host:port")?;
                let addr = value
                    .parse()
                    .map_err(|_| format!("bad seed address {value}"))?;
                config.seeds.push(addr);
            }
            "--outbound" => {
                let value = iter.next().ok_or("--outbound requires a value")?;
                config.outbound_target = value
                    .parse()
                    .map_err(|_| format!("bad outbound count {value}"))?;
            }
            other => return Err(format!("unknown argument {other}")),
        }
    }
    Ok(config)
}
