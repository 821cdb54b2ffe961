use async_trait::async_trait;
use secp256k1::{PublicKey, Secp256k1, SecretKey};

use crate::codec::{keccak256, Attestation, AttestationBody, GuardianSignature};
use crate::store::{KvStore, MemoryStore, StoreError};
use crate::types::{ChainId, EmitterAddress, Message};
use crate::verify::{GuardianKey, GuardianSet};

pub const EMITTER: EmitterAddress = EmitterAddress([0x42; 32]);

pub fn guardians(index: u32, count: usize) -> (Vec<SecretKey>, GuardianSet) {
    let secp = Secp256k1::new();
    let secrets: Vec<SecretKey> = (0..count)
        .map(|i| SecretKey::from_slice(&[i as u8 + 1; 32]).unwrap())
        .collect();
    let keys = secrets
        .iter()
        .map(|sk| GuardianKey::from_public_key(&PublicKey::from_secret_key(&secp, sk)))
        .collect();
    (secrets, GuardianSet::new(index, keys))
}

pub fn test_body(sequence: u64) -> AttestationBody {
    AttestationBody {
        emitter_chain: ChainId::Ethereum.wire_id(),
        emitter_address: EMITTER,
        sequence,
        payload_hash: keccak256(&payload_for(sequence)),
    }
}

pub fn payload_for(sequence: u64) -> Vec<u8> {
    format!("payload-{}", sequence).into_bytes()
}

pub fn test_message(sequence: u64, created_at: u64) -> Message {
    Message::new(
        ChainId::Ethereum,
        ChainId::Solana,
        EMITTER,
        sequence,
        "alice".to_string(),
        "bob".to_string(),
        payload_for(sequence),
        100,
        created_at,
    )
}

pub fn signed_attestation(
    set_index: u32,
    secrets: &[SecretKey],
    signers: &[u8],
    body: AttestationBody,
) -> Attestation {
    let secp = Secp256k1::new();
    let digest = body.digest();
    let message = secp256k1::Message::from_digest_slice(digest.as_bytes()).unwrap();
    let signatures = signers
        .iter()
        .map(|&index| {
            let recoverable = secp.sign_ecdsa_recoverable(&message, &secrets[index as usize]);
            let (recovery_id, compact) = recoverable.serialize_compact();
            let mut signature = [0u8; 65];
            signature[..64].copy_from_slice(&compact);
            signature[64] = recovery_id.to_i32() as u8;
            GuardianSignature {
                guardian_index: index,
                signature,
            }
        })
        .collect();
    Attestation::new(set_index, signatures, body).unwrap()
}

/// Memory store whose next write to a key under a chosen prefix fails.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_next: std::sync::Mutex<Option<String>>,
}

impl FlakyStore {
    pub fn fail_next_write(&self, prefix: &str) {
        *self.fail_next.lock().unwrap() = Some(prefix.to_string());
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        let mut fail_next = self.fail_next.lock().unwrap();
        if fail_next.as_deref().map_or(false, |prefix| key.starts_with(prefix)) {
            *fail_next = None;
            return Err(StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check(key)?;
        self.inner.put(key, value).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
    ) -> Result<bool, StoreError> {
        self.check(key)?;
        self.inner.compare_and_swap(key, expected, new).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.inner.scan_prefix(prefix).await
    }
}
