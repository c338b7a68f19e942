//! Per-network parameters.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Floonet,
    Testnet,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Floonet => "floonet",
            Network::Testnet => "testnet",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// Default listening port for P2P connections.
    pub p2p_port: u16,
    /// First two bytes of every frame on this network.
    pub magic: [u8; 2],
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            p2p_port: 3414,
            magic: [0x1E, 0xC5],
        },
        Network::Floonet => ChainParams {
            network,
            p2p_port: 13414,
            magic: [0x1E, 0xC5],
        },
        Network::Testnet => ChainParams {
            network,
            p2p_port: 23414,
            magic: [0x1E, 0xC5],
        },
    }
}
