//! Pass 3: converge the pool table with scaling-group membership, per tier.
//! The reconciler is the sole authority for pool membership; the request
//! path only ever flips claim status.

use crate::core::task_poller::{PollContext, PollResult, PollTimer, PollerState, TaskPoller};
use labpool_common::{
    cloud::InstanceState,
    now_ts,
    store::definitions::{StorableObjectType, Store},
    types::instance::{InstanceRecord, InstanceRecordKey, InstanceStatus},
};
use std::collections::HashSet;

pub struct PoolSyncPoller {
    counter: PollTimer,
}

impl PoolSyncPoller {
    pub fn new() -> Self {
        Self {
            counter: PollTimer::from(1),
        }
    }
}

#[async_trait::async_trait]
impl<S: Store> TaskPoller<S> for PoolSyncPoller {
    async fn poll(&mut self, context: &PollContext<S>) -> PollResult {
        sync_pool(context, now_ts()).await
    }

    async fn poll_timer(&mut self, _context: &PollContext<S>) -> bool {
        self.counter.poll()
    }
}

fn status_for_state(state: InstanceState) -> InstanceStatus {
    match state {
        InstanceState::Pending => InstanceStatus::Starting,
        _ => InstanceStatus::Available,
    }
}

#[tracing::instrument(skip(context), fields(request.reconcile = true))]
pub(crate) async fn sync_pool<S: Store>(context: &PollContext<S>, now: i64) -> PollResult {
    let cloud = context.registry().cloud();
    let store = context.store();

    for tier in context.registry().config().deployed_tiers() {
        let members = match cloud.group_members(&tier.group_name).await {
            Ok(members) => members,
            Err(error) => {
                tracing::warn!(group = %tier.group_name, %error, "Group listing failed");
                continue;
            }
        };
        let member_ids: HashSet<&str> = members
            .iter()
            .map(|member| member.instance_id.as_str())
            .collect();

        let records: Vec<InstanceRecord> =
            store.get_prefix(StorableObjectType::Instance).await?;
        let tier_records: Vec<&InstanceRecord> = records
            .iter()
            .filter(|record| record.plan == tier.plan)
            .collect();
        let known: HashSet<&str> = tier_records
            .iter()
            .map(|record| record.instance_id.as_str())
            .collect();

        // cloud members we have never seen become pool records
        for member in members
            .iter()
            .filter(|member| member.lifecycle_state.claimable())
        {
            if known.contains(member.instance_id.as_str()) {
                continue;
            }
            let description = match cloud.describe(&member.instance_id).await {
                Ok(description) => description,
                Err(error) => {
                    tracing::warn!(instance.id = %member.instance_id, %error, "Describe failed");
                    continue;
                }
            };
            let record = InstanceRecord {
                instance_id: member.instance_id.clone(),
                status: status_for_state(description.state),
                plan: tier.plan,
                discovered_at: Some(now),
                instance_state: Some(description.state),
                updated_at: Some(now),
                ..Default::default()
            };
            // a concurrent claim may have created the record first; that
            // version wins
            let _ = store.create_if_absent(&record).await?;
            tracing::info!(
                instance.id = %member.instance_id,
                status = %record.status,
                "Discovered pool instance"
            );
        }

        // records whose instance left the group are dropped
        for record in &tier_records {
            if !member_ids.contains(record.instance_id.as_str()) {
                store
                    .delete_obj(&InstanceRecordKey::from(&record.instance_id))
                    .await?;
                tracing::info!(instance.id = %record.instance_id, "Dropped departed instance");
                continue;
            }

            // promote starting instances that came up, free stopped ones
            // that nobody owns
            let description = match cloud.describe(&record.instance_id).await {
                Ok(description) => description,
                Err(_) => continue,
            };
            let mut updated = (*record).clone();
            updated.instance_state = Some(description.state);
            match description.state {
                // warm-started instances with a session attached are
                // finalized by the status path, not freed here
                InstanceState::Running
                    if record.status == InstanceStatus::Starting
                        && record.session_id.is_none() =>
                {
                    updated.status = InstanceStatus::Available;
                }
                InstanceState::Stopped if record.status != InstanceStatus::Assigned => {
                    updated.status = InstanceStatus::Available;
                }
                _ => {}
            }
            if updated != **record {
                updated.updated_at = Some(now);
                // lost races mean someone claimed it meanwhile; fine
                let _ = store.compare_and_put(*record, &updated).await?;
            }
        }
    }
    Ok(PollerState::Idle)
}
