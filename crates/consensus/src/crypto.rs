//! Commitment arithmetic and kernel signatures.
//!
//! Kernel excesses and output commitments are secp256k1 points in compressed
//! form. The balance identity ties them together: the sum of unspent output
//! commitments equals the sum of spent inputs, kernel excesses and the
//! accumulated kernel offset times the generator.

use std::sync::OnceLock;

use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Scalar, Secp256k1, SecretKey};

use mwd_primitives::transaction::{Commitment, Output, TxKernel, MAX_RANGEPROOF_LEN};

pub const MIN_RANGEPROOF_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CryptoError {
    InvalidCommitment,
    InvalidSignature,
    InvalidOffset,
    SumMismatch,
    InvalidRangeproof,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::InvalidCommitment => write!(f, "malformed commitment"),
            CryptoError::InvalidSignature => write!(f, "kernel signature verification failed"),
            CryptoError::InvalidOffset => write!(f, "kernel offset out of range"),
            CryptoError::SumMismatch => write!(f, "commitment sums do not balance"),
            CryptoError::InvalidRangeproof => write!(f, "malformed rangeproof"),
        }
    }
}

impl std::error::Error for CryptoError {}

fn secp() -> &'static Secp256k1<All> {
    static SECP: OnceLock<Secp256k1<All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

fn parse_point(commitment: &Commitment) -> Result<PublicKey, CryptoError> {
    PublicKey::from_slice(commitment.as_bytes()).map_err(|_| CryptoError::InvalidCommitment)
}

/// The offset scalar times G, or `None` for the zero offset.
fn offset_point(offset: &[u8; 32]) -> Result<Option<PublicKey>, CryptoError> {
    if offset.iter().all(|byte| *byte == 0) {
        return Ok(None);
    }
    let key = SecretKey::from_slice(offset).map_err(|_| CryptoError::InvalidOffset)?;
    Ok(Some(PublicKey::from_secret_key(secp(), &key)))
}

fn combine(points: &[PublicKey]) -> Result<Option<PublicKey>, CryptoError> {
    if points.is_empty() {
        return Ok(None);
    }
    let refs: Vec<&PublicKey> = points.iter().collect();
    PublicKey::combine_keys(&refs)
        .map(Some)
        .map_err(|_| CryptoError::SumMismatch)
}

/// Verifies `sum(outputs) == sum(inputs) + sum(excesses) + offset*G`.
///
/// For a standalone transaction, `inputs` holds the spent commitments and
/// `offset` the transaction offset. For the chain-level identity, `inputs`
/// is empty, `outputs` the unspent set, and `offset` the header's
/// accumulated kernel offset.
pub fn verify_kernel_sums(
    inputs: &[Commitment],
    outputs: &[Commitment],
    excesses: &[Commitment],
    offset: &[u8; 32],
) -> Result<(), CryptoError> {
    let mut lhs = Vec::with_capacity(outputs.len());
    for commitment in outputs {
        lhs.push(parse_point(commitment)?);
    }

    let mut rhs = Vec::with_capacity(inputs.len() + excesses.len() + 1);
    for commitment in inputs {
        rhs.push(parse_point(commitment)?);
    }
    for excess in excesses {
        rhs.push(parse_point(excess)?);
    }
    if let Some(point) = offset_point(offset)? {
        rhs.push(point);
    }

    match (combine(&lhs)?, combine(&rhs)?) {
        (None, None) => Ok(()),
        (Some(lhs), Some(rhs)) if lhs == rhs => Ok(()),
        _ => Err(CryptoError::SumMismatch),
    }
}

/// Verifies one kernel signature: ECDSA over the kernel message with the
/// excess as the public key.
pub fn verify_kernel_signature(kernel: &TxKernel) -> Result<(), CryptoError> {
    let excess = parse_point(&kernel.excess)?;
    let digest = TxKernel::message(kernel.fee, kernel.lock_height);
    let message = Message::from_digest(digest);
    let signature =
        Signature::from_compact(&kernel.signature).map_err(|_| CryptoError::InvalidSignature)?;
    secp()
        .verify_ecdsa(&message, &signature, &excess)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Verifies a batch of kernels; fails on the first bad signature.
pub fn verify_kernel_signatures<'a, I>(kernels: I) -> Result<(), CryptoError>
where
    I: IntoIterator<Item = &'a TxKernel>,
{
    for kernel in kernels {
        verify_kernel_signature(kernel)?;
    }
    Ok(())
}

/// Structural rangeproof policy. Full bulletproof verification lives behind
/// an external crypto collaborator; the node enforces shape so malformed
/// proofs never reach the MMR.
pub fn verify_rangeproof(output: &Output) -> Result<(), CryptoError> {
    let len = output.rangeproof.len();
    if !(MIN_RANGEPROOF_LEN..=MAX_RANGEPROOF_LEN).contains(&len) {
        return Err(CryptoError::InvalidRangeproof);
    }
    Ok(())
}

/// Adds two kernel offsets modulo the curve order. The zero offset is the
/// identity.
pub fn add_kernel_offsets(a: &[u8; 32], b: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    if a.iter().all(|byte| *byte == 0) {
        return Ok(*b);
    }
    if b.iter().all(|byte| *byte == 0) {
        return Ok(*a);
    }
    let key = SecretKey::from_slice(a).map_err(|_| CryptoError::InvalidOffset)?;
    let tweak = Scalar::from_be_bytes(*b).map_err(|_| CryptoError::InvalidOffset)?;
    match key.add_tweak(&tweak) {
        Ok(sum) => Ok(sum.secret_bytes()),
        // The offsets cancelled exactly.
        Err(_) => Ok([0u8; 32]),
    }
}

/// Subtracts one kernel offset from another modulo the curve order.
pub fn sub_kernel_offsets(a: &[u8; 32], b: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    if b.iter().all(|byte| *byte == 0) {
        return Ok(*a);
    }
    let negated = SecretKey::from_slice(b)
        .map_err(|_| CryptoError::InvalidOffset)?
        .negate()
        .secret_bytes();
    add_kernel_offsets(a, &negated)
}

/// Signs a kernel message with the secret behind the excess. Test and tooling
/// helper; the node never holds keys.
pub fn sign_kernel(secret: &SecretKey, fee: u64, lock_height: u64) -> [u8; 64] {
    let digest = TxKernel::message(fee, lock_height);
    let message = Message::from_digest(digest);
    secp().sign_ecdsa(&message, secret).serialize_compact()
}

/// Compressed point for a secret scalar. Test and tooling helper.
pub fn commit_to_point(secret: &SecretKey) -> Commitment {
    let point = PublicKey::from_secret_key(secp(), secret);
    Commitment(point.serialize())
}
