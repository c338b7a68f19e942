use mwd_consensus::constants::{
    INPUT_WEIGHT, KERNEL_WEIGHT, MAX_BLOCK_WEIGHT, OUTPUT_WEIGHT,
};
use mwd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder, ProtocolVersion};
use crate::hash::hash_parts;

/// Serialized Pedersen commitment.
pub const COMMITMENT_SIZE: usize = 33;
/// Serialized compact Schnorr signature.
pub const SIGNATURE_SIZE: usize = 64;
/// Upper bound on a serialized Bulletproof.
pub const MAX_RANGE_PROOF_SIZE: usize = 675;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Commitment(pub [u8; COMMITMENT_SIZE]);

impl Commitment {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SignatureBytes(pub [u8; SIGNATURE_SIZE]);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RangeProofBytes(pub Vec<u8>);

impl RangeProofBytes {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A 32-byte blinding factor (or sum of blinding factors). All-zero means
/// "no offset".
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlindingBytes(pub [u8; 32]);

impl BlindingBytes {
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputFeatures {
    Plain,
    Coinbase,
}

impl OutputFeatures {
    pub fn as_u8(self) -> u8 {
        match self {
            OutputFeatures::Plain => 0,
            OutputFeatures::Coinbase => 1,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(OutputFeatures::Plain),
            1 => Ok(OutputFeatures::Coinbase),
            other => Err(DecodeError::UnsupportedVariant(other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KernelFeatures {
    Plain,
    Coinbase,
    HeightLocked,
}

impl KernelFeatures {
    pub fn as_u8(self) -> u8 {
        match self {
            KernelFeatures::Plain => 0,
            KernelFeatures::Coinbase => 1,
            KernelFeatures::HeightLocked => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(KernelFeatures::Plain),
            1 => Ok(KernelFeatures::Coinbase),
            2 => Ok(KernelFeatures::HeightLocked),
            other => Err(DecodeError::UnsupportedVariant(other)),
        }
    }
}

/// Spends a prior unspent output, referenced by commitment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxInput {
    pub features: OutputFeatures,
    pub commit: Commitment,
}

impl TxInput {
    pub fn write(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.features.as_u8());
        encoder.write_bytes(self.commit.as_bytes());
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let features = OutputFeatures::from_u8(decoder.read_u8()?)?;
        let commit = Commitment(decoder.read_fixed::<COMMITMENT_SIZE>()?);
        Ok(Self { features, commit })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOutput {
    pub features: OutputFeatures,
    pub commit: Commitment,
    pub proof: RangeProofBytes,
}

impl TxOutput {
    pub fn is_coinbase(&self) -> bool {
        self.features == OutputFeatures::Coinbase
    }

    pub fn write(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.features.as_u8());
        encoder.write_bytes(self.commit.as_bytes());
        encoder.write_var_bytes(self.proof.as_bytes());
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let features = OutputFeatures::from_u8(decoder.read_u8()?)?;
        let commit = Commitment(decoder.read_fixed::<COMMITMENT_SIZE>()?);
        let proof = RangeProofBytes(decoder.read_var_bytes(MAX_RANGE_PROOF_SIZE)?);
        Ok(Self {
            features,
            commit,
            proof,
        })
    }

    /// Leaf bytes hashed into the output MMR (proof excluded; proofs have
    /// their own MMR).
    pub fn leaf_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + COMMITMENT_SIZE);
        out.push(self.features.as_u8());
        out.extend_from_slice(self.commit.as_bytes());
        out
    }
}

/// Signed proof-of-balance carrying the fee and any lock height. The excess
/// commitment doubles as the public key for the signature.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxKernel {
    pub features: KernelFeatures,
    pub fee: u64,
    pub lock_height: u64,
    pub excess: Commitment,
    pub excess_sig: SignatureBytes,
}

impl TxKernel {
    pub fn is_coinbase(&self) -> bool {
        self.features == KernelFeatures::Coinbase
    }

    /// The message the excess signature commits to.
    pub fn msg_to_sign(&self) -> Hash256 {
        match self.features {
            KernelFeatures::HeightLocked => hash_parts(&[
                &[self.features.as_u8()],
                &self.fee.to_be_bytes(),
                &self.lock_height.to_be_bytes(),
            ]),
            _ => hash_parts(&[&[self.features.as_u8()], &self.fee.to_be_bytes()]),
        }
    }

    /// Kernel identity: hash of the canonical (V2) serialization.
    pub fn hash(&self) -> Hash256 {
        let mut encoder = Encoder::new(ProtocolVersion::V2);
        self.write(&mut encoder);
        crate::hash::hash(&encoder.into_inner())
    }

    /// Feature-dependent field sanity, independent of any chain state.
    pub fn well_formed(&self) -> bool {
        match self.features {
            KernelFeatures::Plain => self.lock_height == 0,
            KernelFeatures::Coinbase => self.fee == 0 && self.lock_height == 0,
            KernelFeatures::HeightLocked => true,
        }
    }

    pub fn write(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.features.as_u8());
        match encoder.version() {
            ProtocolVersion::V1 => {
                encoder.write_u64(self.fee);
                encoder.write_u64(self.lock_height);
            }
            ProtocolVersion::V2 => match self.features {
                KernelFeatures::Plain => encoder.write_u64(self.fee),
                KernelFeatures::Coinbase => {}
                KernelFeatures::HeightLocked => {
                    encoder.write_u64(self.fee);
                    encoder.write_u64(self.lock_height);
                }
            },
        }
        encoder.write_bytes(self.excess.as_bytes());
        encoder.write_bytes(&self.excess_sig.0);
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let features = KernelFeatures::from_u8(decoder.read_u8()?)?;
        let (fee, lock_height) = match decoder.version() {
            ProtocolVersion::V1 => (decoder.read_u64()?, decoder.read_u64()?),
            ProtocolVersion::V2 => match features {
                KernelFeatures::Plain => (decoder.read_u64()?, 0),
                KernelFeatures::Coinbase => (0, 0),
                KernelFeatures::HeightLocked => (decoder.read_u64()?, decoder.read_u64()?),
            },
        };
        let excess = Commitment(decoder.read_fixed::<COMMITMENT_SIZE>()?);
        let excess_sig = SignatureBytes(decoder.read_fixed::<SIGNATURE_SIZE>()?);
        Ok(Self {
            features,
            fee,
            lock_height,
            excess,
            excess_sig,
        })
    }

    /// Leaf bytes hashed into the kernel MMR.
    pub fn leaf_bytes(&self) -> Vec<u8> {
        let mut encoder = Encoder::new(ProtocolVersion::V2);
        self.write(&mut encoder);
        encoder.into_inner()
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TransactionBody {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub kernels: Vec<TxKernel>,
}

impl TransactionBody {
    /// Consensus sort order: inputs and outputs by commitment, kernels by
    /// features then excess.
    pub fn sort(&mut self) {
        self.inputs.sort_by_key(|input| input.commit);
        self.outputs.sort_by(|a, b| a.commit.cmp(&b.commit));
        self.kernels
            .sort_by(|a, b| (a.features.as_u8(), a.excess).cmp(&(b.features.as_u8(), b.excess)));
    }

    pub fn fee(&self) -> u64 {
        self.kernels
            .iter()
            .fold(0u64, |acc, kernel| acc.saturating_add(kernel.fee))
    }

    pub fn weight(&self) -> u64 {
        (self.inputs.len() as u64)
            .saturating_mul(INPUT_WEIGHT)
            .saturating_add((self.outputs.len() as u64).saturating_mul(OUTPUT_WEIGHT))
            .saturating_add((self.kernels.len() as u64).saturating_mul(KERNEL_WEIGHT))
    }

    /// Highest kernel lock height in the body; the earliest height the body
    /// may be confirmed at.
    pub fn max_lock_height(&self) -> u64 {
        self.kernels
            .iter()
            .filter(|kernel| kernel.features == KernelFeatures::HeightLocked)
            .map(|kernel| kernel.lock_height)
            .max()
            .unwrap_or(0)
    }

    /// Merges several bodies into one, re-sorting to the consensus order.
    pub fn aggregate(bodies: impl IntoIterator<Item = TransactionBody>) -> TransactionBody {
        let mut out = TransactionBody::default();
        for body in bodies {
            out.inputs.extend(body.inputs);
            out.outputs.extend(body.outputs);
            out.kernels.extend(body.kernels);
        }
        out.sort();
        out
    }

    pub fn write(&self, encoder: &mut Encoder) {
        encoder.write_u64(self.inputs.len() as u64);
        encoder.write_u64(self.outputs.len() as u64);
        encoder.write_u64(self.kernels.len() as u64);
        for input in &self.inputs {
            input.write(encoder);
        }
        for output in &self.outputs {
            output.write(encoder);
        }
        for kernel in &self.kernels {
            kernel.write(encoder);
        }
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let input_count = decoder.read_count((MAX_BLOCK_WEIGHT / INPUT_WEIGHT) as usize)?;
        let output_count = decoder.read_count((MAX_BLOCK_WEIGHT / OUTPUT_WEIGHT) as usize)?;
        let kernel_count = decoder.read_count((MAX_BLOCK_WEIGHT / KERNEL_WEIGHT) as usize)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(TxInput::read(decoder)?);
        }
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(TxOutput::read(decoder)?);
        }
        let mut kernels = Vec::with_capacity(kernel_count);
        for _ in 0..kernel_count {
            kernels.push(TxKernel::read(decoder)?);
        }
        Ok(Self {
            inputs,
            outputs,
            kernels,
        })
    }
}

/// A mempool transaction: a body plus the transaction's own offset blinding
/// factor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub offset: BlindingBytes,
    pub body: TransactionBody,
}

impl Transaction {
    pub fn fee(&self) -> u64 {
        self.body.fee()
    }

    pub fn kernel_hashes(&self) -> Vec<Hash256> {
        self.body.kernels.iter().map(TxKernel::hash).collect()
    }

    /// Identity used by the pools: the hash of the first kernel.
    pub fn first_kernel_hash(&self) -> Option<Hash256> {
        self.body.kernels.first().map(TxKernel::hash)
    }

    pub fn write(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.offset.0);
        self.body.write(encoder);
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let offset = BlindingBytes(decoder.read_fixed::<32>()?);
        let body = TransactionBody::read(decoder)?;
        Ok(Self { offset, body })
    }
}
