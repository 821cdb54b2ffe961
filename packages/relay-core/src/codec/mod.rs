//! Binary attestation format.
//!
//! ```text
//! [0]        version (1)
//! [1..5]     guardian set index, u32 big-endian
//! [5]        signature count N
//! [6..6+66N] N x (guardian index u8 || 65-byte recoverable signature)
//! [..]       body: emitter chain u16 | emitter address 32B | sequence u64 | payload hash 32B
//! ```
//!
//! Guardian indices must be strictly increasing. Duplicates or out-of-order
//! indices are rejected here, before any signature is checked.

use sha3::{Digest as _, Keccak256};

use crate::types::{ChainId, Digest, EmitterAddress};

pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 6;
pub const SIGNATURE_LEN: usize = 65;
pub const SIGNATURE_ENTRY_LEN: usize = 1 + SIGNATURE_LEN;
pub const BODY_LEN: usize = 2 + 32 + 8 + 32;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedAttestation {
    #[error("Malformed attestation: truncated, needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Malformed attestation: unsupported version {0}")]
    UnsupportedVersion(u8),

    #[error("Malformed attestation: empty signature set")]
    EmptySignatureSet,

    #[error("Malformed attestation: guardian index {index} at position {position} does not follow {previous}")]
    NonIncreasingGuardianIndex { position: usize, previous: u8, index: u8 },

    #[error("Malformed attestation: {0} signatures do not fit the count byte")]
    TooManySignatures(usize),

    #[error("Malformed attestation: {0} trailing bytes after body")]
    TrailingBytes(usize),
}

#[derive(Clone, PartialEq, Eq)]
pub struct GuardianSignature {
    pub guardian_index: u8,
    pub signature: [u8; SIGNATURE_LEN],
}

impl std::fmt::Debug for GuardianSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardianSignature")
            .field("guardian_index", &self.guardian_index)
            .field("signature", &hex::encode(self.signature))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttestationBody {
    pub emitter_chain: u16,
    pub emitter_address: EmitterAddress,
    pub sequence: u64,
    pub payload_hash: [u8; 32],
}

impl AttestationBody {
    pub fn emitter_chain_id(&self) -> Option<ChainId> {
        ChainId::from_wire_id(self.emitter_chain)
    }

    pub fn to_bytes(&self) -> [u8; BODY_LEN] {
        let mut out = [0u8; BODY_LEN];
        out[0..2].copy_from_slice(&self.emitter_chain.to_be_bytes());
        out[2..34].copy_from_slice(self.emitter_address.as_bytes());
        out[34..42].copy_from_slice(&self.sequence.to_be_bytes());
        out[42..74].copy_from_slice(&self.payload_hash);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, MalformedAttestation> {
        if bytes.len() < BODY_LEN {
            return Err(MalformedAttestation::Truncated {
                needed: BODY_LEN,
                available: bytes.len(),
            });
        }
        if bytes.len() > BODY_LEN {
            return Err(MalformedAttestation::TrailingBytes(bytes.len() - BODY_LEN));
        }
        let mut emitter = [0u8; 32];
        emitter.copy_from_slice(&bytes[2..34]);
        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&bytes[34..42]);
        let mut payload_hash = [0u8; 32];
        payload_hash.copy_from_slice(&bytes[42..74]);
        Ok(Self {
            emitter_chain: u16::from_be_bytes([bytes[0], bytes[1]]),
            emitter_address: EmitterAddress(emitter),
            sequence: u64::from_be_bytes(sequence),
            payload_hash,
        })
    }

    pub fn digest(&self) -> Digest {
        Digest(keccak256(&self.to_bytes()))
    }
}

/// A guardian-signed attestation. Immutable; signatures are always sorted by
/// strictly increasing guardian index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    guardian_set_index: u32,
    signatures: Vec<GuardianSignature>,
    body: AttestationBody,
}

impl Attestation {
    pub fn new(
        guardian_set_index: u32,
        signatures: Vec<GuardianSignature>,
        body: AttestationBody,
    ) -> Result<Self, MalformedAttestation> {
        check_signature_order(&signatures)?;
        Ok(Self {
            guardian_set_index,
            signatures,
            body,
        })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, MalformedAttestation> {
        if bytes.len() < HEADER_LEN {
            return Err(MalformedAttestation::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }
        if bytes[0] != VERSION {
            return Err(MalformedAttestation::UnsupportedVersion(bytes[0]));
        }
        let guardian_set_index = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let count = bytes[5] as usize;
        if count == 0 {
            return Err(MalformedAttestation::EmptySignatureSet);
        }

        let body_start = HEADER_LEN + count * SIGNATURE_ENTRY_LEN;
        if bytes.len() < body_start {
            return Err(MalformedAttestation::Truncated {
                needed: body_start,
                available: bytes.len(),
            });
        }

        let signatures = bytes[HEADER_LEN..body_start]
            .chunks_exact(SIGNATURE_ENTRY_LEN)
            .map(|entry| {
                let mut signature = [0u8; SIGNATURE_LEN];
                signature.copy_from_slice(&entry[1..]);
                GuardianSignature {
                    guardian_index: entry[0],
                    signature,
                }
            })
            .collect::<Vec<_>>();
        check_signature_order(&signatures)?;

        let body = AttestationBody::from_bytes(&bytes[body_start..])?;
        Ok(Self {
            guardian_set_index,
            signatures,
            body,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            HEADER_LEN + self.signatures.len() * SIGNATURE_ENTRY_LEN + BODY_LEN,
        );
        out.push(VERSION);
        out.extend_from_slice(&self.guardian_set_index.to_be_bytes());
        out.push(self.signatures.len() as u8);
        for sig in &self.signatures {
            out.push(sig.guardian_index);
            out.extend_from_slice(&sig.signature);
        }
        out.extend_from_slice(&self.body.to_bytes());
        out
    }

    pub fn guardian_set_index(&self) -> u32 {
        self.guardian_set_index
    }

    pub fn signatures(&self) -> &[GuardianSignature] {
        &self.signatures
    }

    pub fn body(&self) -> &AttestationBody {
        &self.body
    }

    pub fn digest(&self) -> Digest {
        self.body.digest()
    }
}

fn check_signature_order(signatures: &[GuardianSignature]) -> Result<(), MalformedAttestation> {
    if signatures.is_empty() {
        return Err(MalformedAttestation::EmptySignatureSet);
    }
    if signatures.len() > u8::MAX as usize {
        return Err(MalformedAttestation::TooManySignatures(signatures.len()));
    }
    for (position, pair) in signatures.windows(2).enumerate() {
        if pair[1].guardian_index <= pair[0].guardian_index {
            return Err(MalformedAttestation::NonIncreasingGuardianIndex {
                position: position + 1,
                previous: pair[0].guardian_index,
                index: pair[1].guardian_index,
            });
        }
    }
    Ok(())
}
