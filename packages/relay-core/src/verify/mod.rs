use async_trait::async_trait;
use log::{debug, info, warn};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{PublicKey, Secp256k1, VerifyOnly};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::codec::{keccak256, Attestation, GuardianSignature};
use crate::types::{Digest, Timestamp};

/// 20-byte guardian address: the tail of keccak256 over the uncompressed
/// public key without its prefix byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuardianKey(pub [u8; 20]);

impl GuardianKey {
    pub fn from_public_key(key: &PublicKey) -> Self {
        let uncompressed = key.serialize_uncompressed();
        let hash = keccak256(&uncompressed[1..]);
        let mut address = [0u8; 20];
        address.copy_from_slice(&hash[12..]);
        Self(address)
    }
}

impl fmt::Debug for GuardianKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GuardianKey({})", hex::encode(self.0))
    }
}

impl FromStr for GuardianKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| format!("Invalid guardian key {}: {}", s, e))?;
        <[u8; 20]>::try_from(bytes.as_slice())
            .map(Self)
            .map_err(|_| format!("Guardian key must be 20 bytes, got {}", bytes.len()))
    }
}

impl Serialize for GuardianKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for GuardianKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianSet {
    pub index: u32,
    pub keys: Vec<GuardianKey>,
    /// Overrides the default two-thirds-plus-one threshold.
    #[serde(default)]
    pub quorum_override: Option<usize>,
}

impl GuardianSet {
    pub fn new(index: u32, keys: Vec<GuardianKey>) -> Self {
        Self {
            index,
            keys,
            quorum_override: None,
        }
    }

    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.quorum_override = Some(quorum);
        self
    }

    /// Default is `floor(2n/3) + 1`, i.e. 13 of 19.
    pub fn quorum(&self) -> usize {
        self.quorum_override
            .unwrap_or_else(|| self.keys.len() * 2 / 3 + 1)
    }
}

/// The current guardian set plus, during a rotation grace window, the one
/// it replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianSets {
    pub current: GuardianSet,
    pub previous: Option<PreviousGuardianSet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousGuardianSet {
    pub set: GuardianSet,
    pub expires_at: Timestamp,
}

impl GuardianSets {
    pub fn new(current: GuardianSet) -> Self {
        Self {
            current,
            previous: None,
        }
    }

    /// Resolves the set an attestation claims to be signed by.
    pub fn resolve(&self, index: u32, now: Timestamp) -> Result<&GuardianSet, VerifyError> {
        if index == self.current.index {
            return Ok(&self.current);
        }
        match &self.previous {
            Some(prev)
                if prev.set.index == index
                    && index.checked_add(1) == Some(self.current.index)
                    && now < prev.expires_at =>
            {
                Ok(&prev.set)
            }
            _ => Err(VerifyError::StaleGuardianSet {
                attestation_index: index,
                current_index: self.current.index,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("Stale guardian set: attestation signed by set {attestation_index}, current is {current_index}")]
    StaleGuardianSet { attestation_index: u32, current_index: u32 },

    #[error("Quorum not met: {signatures} signatures, {quorum} required")]
    QuorumNotMet { signatures: usize, quorum: usize },

    #[error("Bad signature at position {position} (guardian {guardian_index})")]
    BadSignature { position: usize, guardian_index: u8 },
}

/// Verifies an attestation against the guardian sets valid at `now`.
pub fn verify(attestation: &Attestation, sets: &GuardianSets, now: Timestamp) -> Result<(), VerifyError> {
    let set = sets.resolve(attestation.guardian_set_index(), now)?;
    verify_with_set(attestation, set)
}

/// Checks quorum and every signature against a specific set. Any single bad
/// signature rejects the attestation.
pub fn verify_with_set(attestation: &Attestation, set: &GuardianSet) -> Result<(), VerifyError> {
    if attestation.guardian_set_index() != set.index {
        return Err(VerifyError::StaleGuardianSet {
            attestation_index: attestation.guardian_set_index(),
            current_index: set.index,
        });
    }

    let signatures = attestation.signatures();
    let quorum = set.quorum();
    if signatures.len() < quorum {
        debug!("Attestation has {} signatures, quorum is {}", signatures.len(), quorum);
        return Err(VerifyError::QuorumNotMet {
            signatures: signatures.len(),
            quorum,
        });
    }

    let secp = Secp256k1::verification_only();
    let digest = attestation.digest();
    for (position, sig) in signatures.iter().enumerate() {
        let expected = set.keys.get(sig.guardian_index as usize);
        let recovered = recover_guardian(&secp, &digest, sig);
        match (expected, recovered) {
            (Some(expected), Some(recovered)) if *expected == recovered => {}
            _ => {
                warn!(
                    "Bad signature at position {} from guardian {} on {}",
                    position, sig.guardian_index, digest
                );
                return Err(VerifyError::BadSignature {
                    position,
                    guardian_index: sig.guardian_index,
                });
            }
        }
    }
    Ok(())
}

fn recover_guardian(
    secp: &Secp256k1<VerifyOnly>,
    digest: &Digest,
    sig: &GuardianSignature,
) -> Option<GuardianKey> {
    let recovery_id = RecoveryId::from_i32(sig.signature[64] as i32).ok()?;
    let signature = RecoverableSignature::from_compact(&sig.signature[..64], recovery_id).ok()?;
    let message = secp256k1::Message::from_digest_slice(digest.as_bytes()).ok()?;
    let key = secp.recover_ecdsa(&message, &signature).ok()?;
    Some(GuardianKey::from_public_key(&key))
}

/// Read-only provider of the guardian sets, refreshed on rotation.
#[async_trait]
pub trait GuardianSetSource: Send + Sync {
    async fn guardian_sets(&self) -> GuardianSets;
}

/// In-process holder of the guardian sets.
pub struct GuardianSetProvider {
    sets: RwLock<GuardianSets>,
}

impl GuardianSetProvider {
    pub fn new(sets: GuardianSets) -> Self {
        Self {
            sets: RwLock::new(sets),
        }
    }

    /// 轮换守护者集合，旧集合在 `grace` 内仍然有效
    pub async fn rotate(&self, next: GuardianSet, grace: Duration, now: Timestamp) -> Result<(), VerifyError> {
        let mut sets = self.sets.write().await;
        if sets.current.index.checked_add(1) != Some(next.index) {
            return Err(VerifyError::StaleGuardianSet {
                attestation_index: next.index,
                current_index: sets.current.index,
            });
        }
        info!("Rotating guardian set {} -> {}", sets.current.index, next.index);
        let outgoing = std::mem::replace(&mut sets.current, next);
        sets.previous = Some(PreviousGuardianSet {
            set: outgoing,
            expires_at: now.saturating_add(grace.as_millis() as u64),
        });
        Ok(())
    }
}

#[async_trait]
impl GuardianSetSource for GuardianSetProvider {
    async fn guardian_sets(&self) -> GuardianSets {
        self.sets.read().await.clone()
    }
}
