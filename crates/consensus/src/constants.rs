//! Consensus-wide constants shared across validation.

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: u32 = 2;

/// User agent advertised during the handshake.
pub const USER_AGENT: &str = "MW/mwd 0.1.0";

/// Number of bits in a Cuckarooz edge index (2-log of the edge count).
pub const EDGEBITS: u8 = 29;
/// Number of edge indices in a valid Cuckarooz proof.
pub const PROOFSIZE: usize = 42;
/// 2-log of the siphash block size used when deriving edge endpoints.
pub const EDGE_BLOCK_BITS: u32 = 6;

/// Target spacing between blocks, in seconds.
pub const BLOCK_TIME_SEC: u64 = 60;
/// Number of blocks averaged over when computing the difficulty floor.
pub const DIFFICULTY_ADJUST_WINDOW: u64 = 60;
/// Dampening factor applied to the observed window timespan.
pub const DIFFICULTY_DAMP_FACTOR: u64 = 3;
/// Maximum ratio the difficulty floor may move by in a single adjustment.
pub const CLAMP_FACTOR: u64 = 2;
/// Minimum difficulty, also the difficulty of the genesis block.
pub const MIN_DIFFICULTY: u64 = 1;

/// Coinbase reward per block, in base units.
pub const REWARD: u64 = 60_000_000_000;
/// Coinbase outputs can only be spent after this many new blocks.
pub const COINBASE_MATURITY: u64 = 1_440;
/// Number of recent blocks kept as full data; history beyond the horizon is
/// represented by the UTXO/kernel snapshot alone.
pub const CUT_THROUGH_HORIZON: u64 = 10_080;
/// Default number of blocks back from the tip a txhashset snapshot is taken.
pub const STATE_SYNC_THRESHOLD: u64 = 1_000;

/// Weight of one input when computing block/transaction weight.
pub const INPUT_WEIGHT: u64 = 1;
/// Weight of one output (commitment plus range proof).
pub const OUTPUT_WEIGHT: u64 = 21;
/// Weight of one kernel.
pub const KERNEL_WEIGHT: u64 = 3;
/// The maximum allowed total weight for a block body (network rule).
pub const MAX_BLOCK_WEIGHT: u64 = 40_000;

/// How long a misbehaving peer stays banned, in seconds.
pub const BAN_WINDOW_SECS: u64 = 24 * 60 * 60;
/// Minimum interval between txhashset requests from one peer, in seconds.
pub const TXHASHSET_REQUEST_COOLDOWN_SECS: u64 = 2 * 60 * 60;

/// The maximum number of peer addresses sent in one PeerAddrs message.
pub const MAX_PEER_ADDRS: usize = 512;
/// The maximum number of headers sent in one Headers message.
pub const MAX_HEADERS_PER_MSG: usize = 512;
/// The maximum number of hashes in a GetHeaders locator.
pub const MAX_LOCATOR_SIZE: usize = 14;

/// Reward plus fees for a block claiming `fees` in its kernels.
pub fn block_reward(fees: u64) -> u64 {
    REWARD.saturating_add(fees)
}
