use crate::hash::{blake2b, Hash};
use crate::ser::{DecodeError, Decoder, Encoder};

pub const COMMITMENT_LEN: usize = 33;
pub const SIGNATURE_LEN: usize = 64;
/// Upper bound on a serialized rangeproof; proofs are carried opaquely and
/// verified by the crypto layer.
pub const MAX_RANGEPROOF_LEN: usize = 675;

/// Pedersen commitment in compressed form. Doubles as the kernel excess
/// public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Commitment(pub [u8; COMMITMENT_LEN]);

impl Commitment {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != COMMITMENT_LEN {
            return None;
        }
        let mut out = [0u8; COMMITMENT_LEN];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Commitment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

/// Reference to a prior output, spent by this transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Input {
    pub commitment: Commitment,
}

impl Input {
    pub fn write(&self, encoder: &mut Encoder) {
        encoder.write_bytes(self.commitment.as_bytes());
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let commitment = Commitment(decoder.read_fixed::<COMMITMENT_LEN>()?);
        Ok(Self { commitment })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Output {
    pub commitment: Commitment,
    pub rangeproof: Vec<u8>,
}

impl Output {
    pub fn write(&self, encoder: &mut Encoder) {
        encoder.write_bytes(self.commitment.as_bytes());
        encoder.write_var_bytes(&self.rangeproof);
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let commitment = Commitment(decoder.read_fixed::<COMMITMENT_LEN>()?);
        let rangeproof = decoder.read_var_bytes()?;
        if rangeproof.len() > MAX_RANGEPROOF_LEN {
            return Err(DecodeError::InvalidData("rangeproof too large"));
        }
        Ok(Self {
            commitment,
            rangeproof,
        })
    }

    /// Leaf bytes committed into the output MMR and stored in the data file.
    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(COMMITMENT_LEN + 8 + self.rangeproof.len());
        self.write(&mut encoder);
        encoder.into_inner()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let output = Self::read(&mut decoder)?;
        decoder.finish()?;
        Ok(output)
    }
}

impl PartialOrd for Output {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Output {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.commitment
            .cmp(&other.commitment)
            .then_with(|| self.rangeproof.cmp(&other.rangeproof))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxKernel {
    /// Public key committing to the transaction balance.
    pub excess: Commitment,
    /// Signature over [`TxKernel::message`] by the excess key.
    pub signature: [u8; SIGNATURE_LEN],
    pub fee: u64,
    /// Block height before which this kernel may not be included.
    pub lock_height: u64,
}

impl TxKernel {
    pub fn write(&self, encoder: &mut Encoder) {
        encoder.write_bytes(self.excess.as_bytes());
        encoder.write_bytes(&self.signature);
        encoder.write_u64(self.fee);
        encoder.write_u64(self.lock_height);
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let excess = Commitment(decoder.read_fixed::<COMMITMENT_LEN>()?);
        let signature = decoder.read_fixed::<SIGNATURE_LEN>()?;
        let fee = decoder.read_u64()?;
        let lock_height = decoder.read_u64()?;
        Ok(Self {
            excess,
            signature,
            fee,
            lock_height,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(COMMITMENT_LEN + SIGNATURE_LEN + 16);
        self.write(&mut encoder);
        encoder.into_inner()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let kernel = Self::read(&mut decoder)?;
        decoder.finish()?;
        Ok(kernel)
    }

    /// Digest the kernel signature commits to.
    pub fn message(fee: u64, lock_height: u64) -> Hash {
        let mut encoder = Encoder::with_capacity(16);
        encoder.write_u64(fee);
        encoder.write_u64(lock_height);
        blake2b(&encoder.into_inner())
    }
}

impl PartialOrd for TxKernel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TxKernel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.excess
            .cmp(&other.excess)
            .then_with(|| self.fee.cmp(&other.fee))
            .then_with(|| self.lock_height.cmp(&other.lock_height))
            .then_with(|| self.signature.cmp(&other.signature))
    }
}

/// Inputs, outputs and kernels, each sorted by commitment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransactionBody {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub kernels: Vec<TxKernel>,
}

impl TransactionBody {
    pub fn sort(&mut self) {
        self.inputs.sort();
        self.outputs.sort();
        self.kernels.sort();
    }

    pub fn verify_sorted(&self) -> bool {
        self.inputs.windows(2).all(|w| w[0] < w[1])
            && self.outputs.windows(2).all(|w| w[0] < w[1])
            && self.kernels.windows(2).all(|w| w[0] < w[1])
    }

    pub fn fee(&self) -> u64 {
        self.kernels
            .iter()
            .fold(0u64, |acc, kernel| acc.saturating_add(kernel.fee))
    }

    pub fn max_lock_height(&self) -> u64 {
        self.kernels
            .iter()
            .map(|kernel| kernel.lock_height)
            .max()
            .unwrap_or(0)
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
        let input_count = decoder.read_len()?;
        let output_count = decoder.read_len()?;
        let kernel_count = decoder.read_len()?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(Input::read(decoder)?);
        }
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(Output::read(decoder)?);
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

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// Blinding offset split out of the kernel excesses.
    pub offset: [u8; 32],
    pub body: TransactionBody,
}

impl Transaction {
    pub fn new(offset: [u8; 32], mut body: TransactionBody) -> Self {
        body.sort();
        Self { offset, body }
    }

    pub fn write(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.offset);
        self.body.write(encoder);
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let offset = decoder.read_fixed::<32>()?;
        let body = TransactionBody::read(decoder)?;
        Ok(Self { offset, body })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.write(&mut encoder);
        encoder.into_inner()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::read(&mut decoder)?;
        decoder.finish()?;
        Ok(tx)
    }

    pub fn hash(&self) -> Hash {
        blake2b(&self.serialize())
    }

    /// First kernel excess; transactions with no kernels are invalid, so the
    /// pool can key on this.
    pub fn kernel_excess(&self) -> Option<Commitment> {
        self.body.kernels.first().map(|kernel| kernel.excess)
    }
}
