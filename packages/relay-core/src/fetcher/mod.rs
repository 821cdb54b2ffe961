//! Races redundant attestation sources.
//!
//! Sources only ever supply bytes. Every response goes through the codec and
//! the quorum verifier before it is accepted, and the first valid one wins.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::clock::Clock;
use crate::codec::{Attestation, MalformedAttestation};
use crate::types::{ChainId, EmitterAddress, Message};
use crate::verify::{self, GuardianSetSource, GuardianSets, VerifyError};

pub mod http;

pub use http::HttpAttestationSource;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected response: {0}")]
    Response(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Attestation timeout after {elapsed:?} for {emitter_chain}/{emitter_address}/{sequence}")]
    AttestationTimeout {
        emitter_chain: ChainId,
        emitter_address: EmitterAddress,
        sequence: u64,
        elapsed: Duration,
    },

    #[error("No attestation sources configured")]
    NoSources,
}

/// Why a single source response was discarded.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error(transparent)]
    Malformed(#[from] MalformedAttestation),

    #[error(transparent)]
    Invalid(#[from] VerifyError),

    #[error("Attestation is for a different message: {0}")]
    Mismatch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub emitter_chain: ChainId,
    pub emitter_address: EmitterAddress,
    pub sequence: u64,
    pub payload_hash: [u8; 32],
}

impl From<&Message> for FetchRequest {
    fn from(message: &Message) -> Self {
        Self {
            emitter_chain: message.source_chain,
            emitter_address: message.emitter_address,
            sequence: message.sequence,
            payload_hash: message.payload_hash(),
        }
    }
}

/// A place signed attestations can be downloaded from.
#[async_trait]
pub trait AttestationSource: Send + Sync {
    fn name(&self) -> String;

    /// `Ok(None)` means the source does not have a signed copy yet.
    async fn fetch_signed(&self, request: &FetchRequest) -> Result<Option<Vec<u8>>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Wall-clock budget for the whole fetch.
    pub total_timeout: Duration,
    /// Delay between rounds when no source produced a valid attestation.
    pub poll_interval: Duration,
    /// Budget for a single source request within a round.
    pub per_source_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            total_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            per_source_timeout: Duration::from_secs(10),
        }
    }
}

pub struct AttestationFetcher {
    sources: Vec<Arc<dyn AttestationSource>>,
    guardians: Arc<dyn GuardianSetSource>,
    clock: Arc<dyn Clock>,
    config: FetchConfig,
}

impl AttestationFetcher {
    pub fn new(
        sources: Vec<Arc<dyn AttestationSource>>,
        guardians: Arc<dyn GuardianSetSource>,
        clock: Arc<dyn Clock>,
        config: FetchConfig,
    ) -> Self {
        Self {
            sources,
            guardians,
            clock,
            config,
        }
    }

    pub async fn fetch(&self, request: FetchRequest) -> Result<Attestation, FetchError> {
        if self.sources.is_empty() {
            return Err(FetchError::NoSources);
        }
        let started = tokio::time::Instant::now();
        match timeout(self.config.total_timeout, self.poll_until_valid(request)).await {
            Ok(attestation) => Ok(attestation),
            Err(_) => {
                warn!(
                    "No valid attestation for {}/{}/{} within {:?}",
                    request.emitter_chain, request.emitter_address, request.sequence,
                    self.config.total_timeout
                );
                Err(FetchError::AttestationTimeout {
                    emitter_chain: request.emitter_chain,
                    emitter_address: request.emitter_address,
                    sequence: request.sequence,
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    async fn poll_until_valid(&self, request: FetchRequest) -> Attestation {
        let mut round = 0u32;
        loop {
            round += 1;
            if let Some(attestation) = self.race_round(&request).await {
                info!(
                    "Fetched attestation {} for sequence {} in round {}",
                    attestation.digest(), request.sequence, round
                );
                return attestation;
            }
            debug!("Round {} produced no valid attestation for sequence {}", round, request.sequence);
            sleep(self.config.poll_interval).await;
        }
    }

    /// Queries every source concurrently. Returning early drops the
    /// remaining requests.
    async fn race_round(&self, request: &FetchRequest) -> Option<Attestation> {
        let guardians = self.guardians.guardian_sets().await;
        let per_source = self.config.per_source_timeout;

        let mut responses = self
            .sources
            .iter()
            .map(|source| {
                let source = Arc::clone(source);
                async move {
                    let outcome = timeout(per_source, source.fetch_signed(request)).await;
                    (source.name(), outcome)
                }
            })
            .collect::<FuturesUnordered<_>>();

        while let Some((name, outcome)) = responses.next().await {
            match outcome {
                Err(_) => warn!("Source {} timed out after {:?}", name, per_source),
                Ok(Err(e)) => warn!("Source {} failed: {}", name, e),
                Ok(Ok(None)) => debug!("Source {} has no signed attestation yet", name),
                Ok(Ok(Some(bytes))) => {
                    match accept(&bytes, request, &guardians, self.clock.now_ms()) {
                        Ok(attestation) => return Some(attestation),
                        Err(e) => warn!("Discarding response from {}: {}", name, e),
                    }
                }
            }
        }
        None
    }
}

/// Parses, verifies and matches a response against the request.
pub fn accept(
    bytes: &[u8],
    request: &FetchRequest,
    guardians: &GuardianSets,
    now: u64,
) -> Result<Attestation, Rejection> {
    let attestation = Attestation::parse(bytes)?;
    let body = attestation.body();
    if body.emitter_chain != request.emitter_chain.wire_id()
        || body.emitter_address != request.emitter_address
        || body.sequence != request.sequence
    {
        return Err(Rejection::Mismatch(format!(
            "got {}/{}/{}",
            body.emitter_chain, body.emitter_address, body.sequence
        )));
    }
    if body.payload_hash != request.payload_hash {
        return Err(Rejection::Mismatch("payload hash differs".to_string()));
    }
    verify::verify(&attestation, guardians, now)?;
    Ok(attestation)
}
