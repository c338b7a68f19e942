//! Pedersen commitment arithmetic and kernel signature verification.
//!
//! Thin, typed layer over the secp256k1-zkp bindings. All functions take and
//! return the wire byte types from `mwd_primitives`; conversion failures and
//! arithmetic failures surface as `CryptoError`, never panics.

mod commit;
mod rproof;
mod sig;

use std::fmt;
use std::sync::{Mutex, MutexGuard, OnceLock};

use secp::{ContextFlag, Secp256k1};

pub use commit::{blind_sum, commit, commit_value, sum_commits};
pub use rproof::{create_range_proof, verify_range_proof, verify_range_proofs};
pub use sig::{batch_verify_kernels, sign_message, verify_kernel_sig};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CryptoError {
    /// The underlying library rejected an input or an operation.
    Secp(secp::Error),
    /// A kernel signature failed verification; the index names the culprit
    /// within the batch that was checked.
    InvalidKernelSignature { index: usize },
    /// A range proof failed verification.
    InvalidRangeProof { index: usize },
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::Secp(err) => write!(f, "secp256k1 failure: {err:?}"),
            CryptoError::InvalidKernelSignature { index } => {
                write!(f, "invalid kernel signature at index {index}")
            }
            CryptoError::InvalidRangeProof { index } => {
                write!(f, "invalid range proof at index {index}")
            }
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<secp::Error> for CryptoError {
    fn from(err: secp::Error) -> Self {
        CryptoError::Secp(err)
    }
}

/// Process-wide context with commit capabilities. The bindings are not
/// re-entrant, so access is serialized behind a mutex.
pub(crate) fn secp_ctx() -> MutexGuard<'static, Secp256k1> {
    static SECP: OnceLock<Mutex<Secp256k1>> = OnceLock::new();
    SECP.get_or_init(|| Mutex::new(Secp256k1::with_caps(ContextFlag::Commit)))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
