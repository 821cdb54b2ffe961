use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Milliseconds since the unix epoch.
pub type Timestamp = u64;

/// Chains known to the relayer, ordered by their 16-bit wire id.
///
/// Parsed once when configuration is loaded; nothing downstream re-parses
/// chain names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
    Solana,
    Ethereum,
    Bsc,
    Polygon,
    Avalanche,
    Sui,
    Aptos,
    Arbitrum,
    Optimism,
    Base,
}

impl ChainId {
    pub const ALL: [ChainId; 10] = [
        ChainId::Solana,
        ChainId::Ethereum,
        ChainId::Bsc,
        ChainId::Polygon,
        ChainId::Avalanche,
        ChainId::Sui,
        ChainId::Aptos,
        ChainId::Arbitrum,
        ChainId::Optimism,
        ChainId::Base,
    ];

    pub fn wire_id(self) -> u16 {
        match self {
            ChainId::Solana => 1,
            ChainId::Ethereum => 2,
            ChainId::Bsc => 4,
            ChainId::Polygon => 5,
            ChainId::Avalanche => 6,
            ChainId::Sui => 21,
            ChainId::Aptos => 22,
            ChainId::Arbitrum => 23,
            ChainId::Optimism => 24,
            ChainId::Base => 30,
        }
    }

    pub fn from_wire_id(id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.wire_id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            ChainId::Solana => "solana",
            ChainId::Ethereum => "ethereum",
            ChainId::Bsc => "bsc",
            ChainId::Polygon => "polygon",
            ChainId::Avalanche => "avalanche",
            ChainId::Sui => "sui",
            ChainId::Aptos => "aptos",
            ChainId::Arbitrum => "arbitrum",
            ChainId::Optimism => "optimism",
            ChainId::Base => "base",
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChainId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.name() == lowered)
            .ok_or_else(|| format!("Unknown chain: {}", s))
    }
}

macro_rules! hex_bytes {
    ($name:ident, $len:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                <[u8; $len]>::try_from(bytes).ok().map(Self)
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(raw).map_err(|e| format!("Invalid hex {}: {}", s, e))?;
                Self::from_slice(&bytes).ok_or_else(|| {
                    format!("Expected {} bytes, got {}", $len, bytes.len())
                })
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_bytes!(EmitterAddress, 32);
hex_bytes!(Digest, 32);

/// Serde adapter storing byte vectors as hex strings.
pub mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Attested,
    Relaying,
    Executed,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Executed | MessageStatus::Failed | MessageStatus::Expired)
    }

    fn rank(self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Attested => 1,
            MessageStatus::Relaying => 2,
            MessageStatus::Executed => 3,
            MessageStatus::Failed | MessageStatus::Expired => u8::MAX,
        }
    }

    /// Whether `next` is a legal transition from `self`.
    ///
    /// Statuses advance one step at a time; `Failed` and `Expired` are
    /// reachable from any non-terminal status. Terminal statuses never move.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            MessageStatus::Failed | MessageStatus::Expired => true,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    AttestationTimeout,
    MaxAttemptsExceeded,
    Permanent(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::AttestationTimeout => f.write_str("attestation timeout"),
            FailureReason::MaxAttemptsExceeded => f.write_str("max attempts exceeded"),
            FailureReason::Permanent(detail) => write!(f, "permanent: {}", detail),
        }
    }
}

/// A cross-chain message tracked by the relay queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub source_chain: ChainId,
    pub dest_chain: ChainId,
    pub emitter_address: EmitterAddress,
    pub sender: String,
    pub recipient: String,
    #[serde(with = "hex_vec")]
    pub payload: Vec<u8>,
    pub amount: u128,
    pub sequence: u64,
    pub created_at: Timestamp,
    pub status: MessageStatus,
    pub failure_reason: Option<FailureReason>,
}

impl Message {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_chain: ChainId,
        dest_chain: ChainId,
        emitter_address: EmitterAddress,
        sequence: u64,
        sender: String,
        recipient: String,
        payload: Vec<u8>,
        amount: u128,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: Self::make_id(source_chain, &emitter_address, sequence),
            source_chain,
            dest_chain,
            emitter_address,
            sender,
            recipient,
            payload,
            amount,
            sequence,
            created_at,
            status: MessageStatus::Pending,
            failure_reason: None,
        }
    }

    pub fn make_id(chain: ChainId, emitter: &EmitterAddress, sequence: u64) -> String {
        format!("{}/{}/{}", chain.wire_id(), emitter.to_hex(), sequence)
    }

    pub fn payload_hash(&self) -> [u8; 32] {
        crate::codec::keccak256(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayQueueItem {
    pub message_id: String,
    pub attestation_digest: Option<Digest>,
    pub attempts: u32,
    pub next_retry_at: Timestamp,
    pub max_attempts: u32,
}

impl RelayQueueItem {
    pub fn new(message_id: String, max_attempts: u32) -> Self {
        Self {
            message_id,
            attestation_digest: None,
            attempts: 0,
            next_retry_at: 0,
            max_attempts,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}
