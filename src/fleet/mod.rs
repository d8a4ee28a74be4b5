//! Fleet-wide status of upgrade campaigns.
//!
//! An instance counts as failed only while none of its campaign operations
//! has succeeded or is still running. A failure that was followed by a
//! successful or ongoing retry is superseded.

pub mod service;

pub use service::CampaignStatus;

use crate::types::{InstanceId, Operation, OperationFilter, OperationState, Page};
use itertools::Itertools;
use std::collections::{BTreeMap, HashMap};

pub type CampaignStats = BTreeMap<OperationState, usize>;

fn group_by_instance(operations: &[Operation]) -> HashMap<&InstanceId, Vec<&Operation>> {
    operations
        .iter()
        .map(|operation| (&operation.instance_id, operation))
        .into_group_map()
}

/// Failed with no succeeded, retrying or in-progress sibling.
fn is_genuinely_failed(records: &[&Operation]) -> bool {
    let superseded = records.iter().any(|op| {
        matches!(
            op.state,
            OperationState::Succeeded | OperationState::Retrying | OperationState::InProgress
        )
    });
    !superseded && records.iter().any(|op| op.state == OperationState::Failed)
}

fn latest_failure<'a>(records: &[&'a Operation]) -> Option<&'a Operation> {
    records
        .iter()
        .copied()
        .filter(|op| op.state == OperationState::Failed)
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
}

/// One representative failed operation per genuinely failed instance,
/// ordered by instance id. The representative is the latest failure.
#[must_use]
pub fn failed_instances(operations: &[Operation]) -> Vec<Operation> {
    group_by_instance(operations)
        .into_iter()
        .filter(|(_, records)| is_genuinely_failed(records))
        .filter_map(|(_, records)| latest_failure(&records).cloned())
        .sorted_by(|a, b| a.instance_id.cmp(&b.instance_id))
        .collect()
}

/// Count per state. `Failed` counts instances, every other state counts records.
#[must_use]
pub fn campaign_stats(operations: &[Operation]) -> CampaignStats {
    let mut stats: CampaignStats = OperationState::ALL
        .iter()
        .map(|state| (*state, 0))
        .collect();
    operations
        .iter()
        .filter(|op| op.state != OperationState::Failed)
        .for_each(|op| *stats.entry(op.state).or_default() += 1);
    stats.insert(OperationState::Failed, failed_instances(operations).len());
    stats
}

/// Paginated campaign listing.
///
/// When the filter asks for `Failed`, failed records are replaced by the
/// representatives of genuinely failed instances; other requested states
/// are listed as stored.
#[must_use]
pub fn list_campaign_operations(
    operations: &[Operation],
    filter: &OperationFilter,
) -> Page<Operation> {
    if !filter.states.contains(&OperationState::Failed) {
        let selected = operations
            .iter()
            .filter(|op| filter.matches(op))
            .cloned()
            .sorted_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .collect();
        return filter.paginate(selected);
    }

    let others = operations
        .iter()
        .filter(|op| op.state != OperationState::Failed && filter.matches(op))
        .cloned();
    let failures = failed_instances(operations)
        .into_iter()
        .filter(|op| filter.matches_ignoring_state(op));
    let selected = others
        .chain(failures)
        .sorted_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
        .collect();
    filter.paginate(selected)
}
