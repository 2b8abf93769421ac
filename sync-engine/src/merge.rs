use serde::{Deserialize, Serialize};

use crate::todo::Todo;

/// Which side wins when both versions carry the same `updatedAt`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieBreakPolicy {
    PreferExisting,
    #[default]
    PreferIncoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    KeepLocal,
    TakeRemote,
}

pub fn decide(local: &Todo, remote: &Todo, policy: TieBreakPolicy) -> MergeDecision {
    match remote.updated_at.cmp(&local.updated_at) {
        std::cmp::Ordering::Greater => MergeDecision::TakeRemote,
        std::cmp::Ordering::Less => MergeDecision::KeepLocal,
        std::cmp::Ordering::Equal => match policy {
            TieBreakPolicy::PreferIncoming => MergeDecision::TakeRemote,
            TieBreakPolicy::PreferExisting => MergeDecision::KeepLocal,
        },
    }
}

/// Last-write-wins on `updatedAt`, whole record. Equal timestamps go to the
/// remote copy so tabs converge on externally sourced updates.
///
/// With more than two writers the tie rule depends on delivery order; it is
/// not commutative.
pub fn resolve_conflict<'a>(local: &'a Todo, remote: &'a Todo) -> &'a Todo {
    match decide(local, remote, TieBreakPolicy::default()) {
        MergeDecision::KeepLocal => local,
        MergeDecision::TakeRemote => remote,
    }
}
