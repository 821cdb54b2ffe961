//! Conflict resolution between per-chain observations.
//!
//! Every strategy is a pure function of the responding states. States are
//! keyed by `ChainId`, whose order is the wire id, so the order in which
//! chains answered never affects the result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::ChainState;
use crate::types::ChainId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Greatest `observed_at`; ties go to the lowest chain.
    Latest,
    /// Most common value; ties go to the value first seen on the lowest chain.
    Consensus,
    /// The first configured chain is authoritative.
    PrimaryChain,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::Latest => f.write_str("latest"),
            MergeStrategy::Consensus => f.write_str("consensus"),
            MergeStrategy::PrimaryChain => f.write_str("primary_chain"),
        }
    }
}

/// Merges the states that responded. `chains` is the configured order and
/// only matters for `PrimaryChain`. Returns `None` when nothing is
/// authoritative.
pub fn merge<T: Clone + Eq>(
    strategy: MergeStrategy,
    chains: &[ChainId],
    states: &BTreeMap<ChainId, ChainState<T>>,
) -> Option<T> {
    match strategy {
        MergeStrategy::Latest => {
            let mut best: Option<&ChainState<T>> = None;
            for state in states.values() {
                if best.map_or(true, |b| state.observed_at > b.observed_at) {
                    best = Some(state);
                }
            }
            best.map(|s| s.data.clone())
        }
        MergeStrategy::Consensus => {
            // (value, count), in order of the lowest chain reporting it
            let mut groups: Vec<(&T, usize)> = Vec::new();
            for state in states.values() {
                match groups.iter_mut().find(|(value, _)| **value == state.data) {
                    Some(group) => group.1 += 1,
                    None => groups.push((&state.data, 1)),
                }
            }
            let mut best: Option<(&T, usize)> = None;
            for (value, count) in groups {
                if best.map_or(true, |(_, c)| count > c) {
                    best = Some((value, count));
                }
            }
            best.map(|(value, _)| value.clone())
        }
        MergeStrategy::PrimaryChain => chains
            .first()
            .and_then(|primary| states.get(primary))
            .map(|s| s.data.clone()),
    }
}
