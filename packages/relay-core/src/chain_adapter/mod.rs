use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{AdapterKind, ChainConfig};
use crate::types::{hex_vec, ChainId, EmitterAddress};

pub mod json_rpc;

pub use json_rpc::JsonRpcAdapter;

/// Destination-chain failures, split into those worth retrying and those
/// that never will succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Node unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed node response: {0}")]
    Decode(String),

    #[error("Transaction dropped from mempool")]
    Dropped,

    #[error("Attestation already redeemed on-chain")]
    AlreadyRedeemed,

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Insufficient relayer balance: {0}")]
    InsufficientFunds(String),

    #[error("Transaction reverted: {0}")]
    Reverted(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Network(_)
                | AdapterError::Timeout
                | AdapterError::Unavailable(_)
                | AdapterError::Decode(_)
                | AdapterError::Dropped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
    Dropped,
}

/// What the relayer asks a destination chain to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub message_id: String,
    pub dest_chain: ChainId,
    pub recipient: String,
    #[serde(with = "hex_vec")]
    pub attestation: Vec<u8>,
    #[serde(with = "hex_vec")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceQuery {
    pub address: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceReading {
    pub amount: u128,
    pub block_number: u64,
    pub block_hash: String,
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    pub emitters: Vec<EmitterAddress>,
    pub from_block: u64,
}

/// An outbound message event as reported by the source chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub emitter_address: EmitterAddress,
    pub sequence: u64,
    pub dest_chain: u16,
    pub sender: String,
    pub recipient: String,
    #[serde(with = "hex_vec")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub amount: u128,
    pub block_number: u64,
}

pub type LogStream = BoxStream<'static, Result<RawEvent, AdapterError>>;

/// 链适配器特征，定义了中继核心与具体链交互所需的全部功能
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// 获取链的类型标识
    fn chain(&self) -> ChainId;

    /// 建立与节点的连接
    async fn connect(&self) -> Result<(), AdapterError>;

    async fn disconnect(&self) -> Result<(), AdapterError>;

    /// 查询地址余额
    async fn get_balance(&self, query: &BalanceQuery) -> Result<BalanceReading, AdapterError>;

    /// 提交证明到目标链
    async fn send_transaction(&self, submission: &Submission) -> Result<TxHash, AdapterError>;

    /// 查询交易状态
    async fn get_transaction_status(&self, tx: &TxHash) -> Result<TxStatus, AdapterError>;

    /// 监听发送方的出站消息事件
    async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogStream, AdapterError>;
}

/// 链适配器工厂，用于创建不同链的适配器实例
#[async_trait]
pub trait ChainAdapterFactory: Send + Sync {
    async fn create_adapter(&self, config: &ChainConfig) -> Result<Arc<dyn ChainAdapter>, AdapterError>;
}

pub struct DefaultChainAdapterFactory;

#[async_trait]
impl ChainAdapterFactory for DefaultChainAdapterFactory {
    async fn create_adapter(&self, config: &ChainConfig) -> Result<Arc<dyn ChainAdapter>, AdapterError> {
        match config.adapter_type {
            AdapterKind::JsonRpc => {
                let adapter = JsonRpcAdapter::new(config.id, &config.rpc_url, config.log_poll_interval());
                Ok(Arc::new(adapter))
            }
        }
    }
}

/// Adapters keyed by chain, resolved once at startup.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: BTreeMap<ChainId, Arc<dyn ChainAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_config(
        chains: &[ChainConfig],
        factory: &dyn ChainAdapterFactory,
    ) -> Result<Self, AdapterError> {
        let mut registry = Self::new();
        for chain in chains {
            let adapter = factory.create_adapter(chain).await?;
            registry.insert(adapter);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(adapter.chain(), adapter);
    }

    pub fn get(&self, chain: ChainId) -> Option<Arc<dyn ChainAdapter>> {
        self.adapters.get(&chain).cloned()
    }

    pub fn contains(&self, chain: ChainId) -> bool {
        self.adapters.contains_key(&chain)
    }

    pub fn chains(&self) -> Vec<ChainId> {
        self.adapters.keys().copied().collect()
    }
}
