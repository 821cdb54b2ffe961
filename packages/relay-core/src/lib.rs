pub mod config;
pub mod types;
pub mod clock;
pub mod codec;
pub mod verify;
pub mod fetcher;
pub mod store;
pub mod queue;
pub mod retry;
pub mod rate_limit;
pub mod chain_adapter;
pub mod relayer;
pub mod pipeline;
pub mod observer;
pub mod reconciler;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use types::{ChainId, Digest, EmitterAddress, FailureReason, Message, MessageStatus, RelayQueueItem};
pub use codec::{Attestation, MalformedAttestation};
pub use verify::{GuardianSet, GuardianSets, VerifyError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Codec(#[from] codec::MalformedAttestation),

    #[error(transparent)]
    Verify(#[from] verify::VerifyError),

    #[error(transparent)]
    Fetch(#[from] fetcher::FetchError),

    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error(transparent)]
    Chain(#[from] chain_adapter::AdapterError),

    #[error(transparent)]
    Relay(#[from] relayer::RelayError),

    #[error(transparent)]
    Reconcile(#[from] reconciler::ReconcileError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
