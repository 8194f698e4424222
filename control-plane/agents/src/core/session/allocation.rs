//! Race-free claiming of pool instances. Every transition out of
//! `available` commits through a conditional update: losing the race is the
//! expected outcome, not an error, and the loser moves on to the next
//! candidate.

use crate::{core::registry::Registry, errors::SvcError};
use labpool_common::{
    cloud::{CloudControl, InstanceState},
    iso_now,
    store::definitions::{CasOutcome, StorableObjectType, Store},
    types::{
        instance::{InstanceRecord, InstanceRecordKey, InstanceStatus},
        plan::PlanTier,
        session::{Session, SessionKey},
    },
};
use std::{collections::HashMap, time::Duration};

const MAX_CLAIM_ATTEMPTS: u32 = 3;
/// Per-cycle cap on how far desired capacity may be raised.
const MAX_SCALE_UP_STEP: u32 = 2;
/// Backoff base between claim attempts.
const CLAIM_BACKOFF_MS: u64 = 300;

/// A successfully claimed instance.
#[derive(Debug, Clone)]
pub struct ClaimedInstance {
    pub instance_id: String,
    pub instance_ip: Option<String>,
}

/// Outcome of the cold-start path.
#[derive(Debug, Clone)]
pub enum Allocation {
    /// A running group member was claimed directly.
    Claimed(ClaimedInstance),
    /// A stopped warm-pool member was started for this session.
    Starting { instance_id: String },
    /// Desired capacity was raised; an instance will appear later.
    ScaledUp,
    /// The group is at max capacity.
    AtCapacity,
}

/// All instance records of the given plan and status.
async fn instances_with_status<S: Store>(
    store: &S,
    plan: PlanTier,
    status: InstanceStatus,
) -> Result<Vec<InstanceRecord>, SvcError> {
    let records: Vec<InstanceRecord> = store.get_prefix(StorableObjectType::Instance).await?;
    Ok(records
        .into_iter()
        .filter(|record| record.status == status && record.plan == plan)
        .collect())
}

/// Mark a record unhealthy, best-effort: a lost race means someone else
/// already changed it.
async fn mark_unhealthy<S: Store>(store: &S, record: &InstanceRecord) -> Result<(), SvcError> {
    let mut unhealthy = record.clone();
    unhealthy.status = InstanceStatus::Unhealthy;
    let _ = store.compare_and_put(record, &unhealthy).await?;
    Ok(())
}

/// Tags applied when an instance is claimed.
fn claim_tags(session: &Session) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    tags.insert("SessionId".to_string(), session.session_id.to_string());
    tags.insert("OwnerId".to_string(), session.owner_id.clone());
    tags.insert("AssignedAt".to_string(), iso_now());
    tags
}

/// Tag an instance after a claim; tagging is metadata, never a failure.
pub async fn apply_claim_tags(cloud: &dyn CloudControl, instance_id: &str, session: &Session) {
    if let Err(error) = cloud.tag(instance_id, &claim_tags(session)).await {
        tracing::warn!(instance.id = instance_id, %error, "Failed to tag claimed instance");
    }
}

/// Clear the claim tags, best-effort.
pub async fn clear_claim_tags(
    cloud: &dyn CloudControl,
    instance_id: &str,
    reason: Option<&str>,
) {
    let mut tags = HashMap::new();
    tags.insert("SessionId".to_string(), String::new());
    tags.insert("OwnerId".to_string(), String::new());
    tags.insert("ReleasedAt".to_string(), iso_now());
    if let Some(reason) = reason {
        tags.insert("TerminationReason".to_string(), reason.to_string());
    }
    if let Err(error) = cloud.tag(instance_id, &tags).await {
        tracing::warn!(instance.id = instance_id, %error, "Failed to clear instance tags");
    }
}

/// Step 5 of the allocation contract: claim an available pool instance of the
/// session's tier, retrying a bounded number of times with backoff. Returns
/// `None` when the pool is dry.
pub async fn claim_pooled<S: Store>(
    registry: &Registry<S>,
    session: &Session,
    now: i64,
) -> Result<Option<ClaimedInstance>, SvcError> {
    let store = registry.store();
    let cloud = registry.cloud();

    for attempt in 1 ..= MAX_CLAIM_ATTEMPTS {
        let candidates =
            instances_with_status(store, session.plan, InstanceStatus::Available).await?;
        tracing::debug!(
            session.id = %session.session_id,
            candidates = candidates.len(),
            attempt,
            "Claiming from the pool"
        );

        for candidate in &candidates {
            // the pool table is only authoritative between reconciler
            // cycles; verify against the cloud before claiming
            let description = match cloud.describe(&candidate.instance_id).await {
                Ok(description) => description,
                Err(error) => {
                    tracing::warn!(
                        instance.id = %candidate.instance_id,
                        %error,
                        "Could not describe candidate, skipping"
                    );
                    continue;
                }
            };
            if !description.state.running() {
                mark_unhealthy(store, candidate).await?;
                continue;
            }

            let claimed =
                candidate.assigned_to(&session.session_id, &session.owner_id, now);
            match store.compare_and_put(candidate, &claimed).await? {
                CasOutcome::Committed => {
                    apply_claim_tags(cloud.as_ref(), &candidate.instance_id, session).await;
                    tracing::info!(
                        session.id = %session.session_id,
                        instance.id = %candidate.instance_id,
                        "Claimed pool instance"
                    );
                    return Ok(Some(ClaimedInstance {
                        instance_id: candidate.instance_id.clone(),
                        instance_ip: description.private_ip,
                    }));
                }
                // another session won this instance, try the next candidate
                CasOutcome::Conflict => continue,
            }
        }

        if attempt < MAX_CLAIM_ATTEMPTS {
            tokio::time::sleep(Duration::from_millis(CLAIM_BACKOFF_MS * attempt as u64)).await;
        }
    }
    Ok(None)
}

/// Whether an assigned-looking record is actually free because its session is
/// gone or finished.
async fn session_is_dead<S: Store>(store: &S, record: &InstanceRecord) -> Result<bool, SvcError> {
    match &record.session_id {
        None => Ok(true),
        Some(session_id) => {
            let session: Option<Session> = store.find_obj(&SessionKey::from(session_id)).await?;
            Ok(match session {
                None => true,
                Some(session) => session.status.terminal(),
            })
        }
    }
}

/// Claim a group member which has no pool record yet, or whose record can be
/// conditionally transitioned to this session.
async fn claim_member<S: Store>(
    store: &S,
    record: Option<InstanceRecord>,
    instance_id: &str,
    session: &Session,
    status: InstanceStatus,
    now: i64,
) -> Result<bool, SvcError> {
    let mut claimed = match &record {
        Some(record) => record.clone(),
        None => InstanceRecord {
            instance_id: instance_id.to_string(),
            discovered_at: Some(now),
            ..Default::default()
        },
    };
    claimed.status = status;
    claimed.plan = session.plan;
    claimed.session_id = Some(session.session_id.clone());
    claimed.owner_id = Some(session.owner_id.clone());
    claimed.assigned_at = Some(now);
    claimed.updated_at = Some(now);

    let outcome = match record {
        Some(observed) => store.compare_and_put(&observed, &claimed).await?,
        None => store.create_if_absent(&claimed).await?,
    };
    Ok(outcome.committed())
}

/// Step 6 of the allocation contract: fall back to the scaling group when the
/// pool is dry. `allow_scale_up` is false on the status-endpoint recovery
/// path, which must not keep raising capacity on every poll.
pub async fn cold_start<S: Store>(
    registry: &Registry<S>,
    session: &Session,
    allow_scale_up: bool,
    now: i64,
) -> Result<Allocation, SvcError> {
    let store = registry.store();
    let cloud = registry.cloud();
    let config = registry.config();

    let group = match config.group_for(session.plan) {
        Some(group) => group,
        None => {
            return Err(SvcError::Internal {
                details: format!("no scaling group configured for plan '{}'", session.plan),
            })
        }
    };

    let members = cloud.group_members(&group).await?;
    tracing::debug!(
        session.id = %session.session_id,
        group = %group,
        members = members.len(),
        "Pool dry, inspecting the scaling group"
    );

    for member in members
        .iter()
        .filter(|member| member.lifecycle_state.claimable())
    {
        let description = match cloud.describe(&member.instance_id).await {
            Ok(description) => description,
            Err(_) => continue,
        };
        let record: Option<InstanceRecord> = store
            .find_obj(&InstanceRecordKey::from(&member.instance_id))
            .await?;
        let record_status = record.as_ref().map(|r| r.status);

        match description.state {
            InstanceState::Stopped if record_status != Some(InstanceStatus::Assigned) => {
                // warm pool: boot it and hand it to this session
                cloud.start(&member.instance_id).await?;
                if claim_member(
                    store,
                    record,
                    &member.instance_id,
                    session,
                    InstanceStatus::Starting,
                    now,
                )
                .await?
                {
                    tracing::info!(
                        session.id = %session.session_id,
                        instance.id = %member.instance_id,
                        "Starting warm-pool instance"
                    );
                    return Ok(Allocation::Starting {
                        instance_id: member.instance_id.clone(),
                    });
                }
            }
            InstanceState::Running => {
                let can_use = match record_status {
                    None | Some(InstanceStatus::Available) => true,
                    Some(InstanceStatus::Starting) | Some(InstanceStatus::Assigned) => {
                        match &record {
                            Some(r) => session_is_dead(store, r).await?,
                            None => true,
                        }
                    }
                    _ => false,
                };
                if can_use
                    && claim_member(
                        store,
                        record,
                        &member.instance_id,
                        session,
                        InstanceStatus::Assigned,
                        now,
                    )
                    .await?
                {
                    apply_claim_tags(cloud.as_ref(), &member.instance_id, session).await;
                    tracing::info!(
                        session.id = %session.session_id,
                        instance.id = %member.instance_id,
                        "Claimed unpooled running instance"
                    );
                    return Ok(Allocation::Claimed(ClaimedInstance {
                        instance_id: member.instance_id.clone(),
                        instance_ip: description.private_ip,
                    }));
                }
            }
            _ => {}
        }
    }

    if !allow_scale_up {
        return Ok(Allocation::ScaledUp);
    }

    let capacity = cloud.group_capacity(&group).await?;
    if capacity.desired < capacity.max {
        let deficit = scale_deficit(store, session.plan).await?;
        let step = deficit.max(1).min(MAX_SCALE_UP_STEP as i64) as u32;
        let new_desired = (capacity.desired + step).min(capacity.max);
        cloud.set_desired(&group, new_desired).await?;
        tracing::info!(
            group = %group,
            desired = new_desired,
            "Raised desired capacity for provisioning session"
        );
        Ok(Allocation::ScaledUp)
    } else {
        Ok(Allocation::AtCapacity)
    }
}

/// How many more instances the tier needs: active sessions minus instances
/// already on their way.
async fn scale_deficit<S: Store>(store: &S, plan: PlanTier) -> Result<i64, SvcError> {
    let sessions: Vec<Session> = store.get_prefix(StorableObjectType::Session).await?;
    let active = sessions
        .iter()
        .filter(|session| session.plan == plan && session.status.in_flight())
        .count() as i64;
    let in_progress = instances_with_status(store, plan, InstanceStatus::Starting)
        .await?
        .len() as i64;
    Ok(active - in_progress)
}

/// Settle a warm-started instance record into `assigned` once its session
/// becomes ready. Lost races are left alone.
pub async fn ensure_assigned<S: Store>(
    store: &S,
    instance_id: &str,
    session: &Session,
    now: i64,
) -> Result<(), SvcError> {
    let record: Option<InstanceRecord> = store
        .find_obj(&InstanceRecordKey::from(instance_id))
        .await?;
    if let Some(record) = record {
        let ours = record
            .session_id
            .as_ref()
            .map(|id| id == &session.session_id)
            .unwrap_or(true);
        if record.status != InstanceStatus::Assigned && ours {
            let assigned = record.assigned_to(&session.session_id, &session.owner_id, now);
            let _ = store.compare_and_put(&record, &assigned).await?;
        }
    }
    Ok(())
}

/// Return an instance to the pool (or mark it stopping). Retries a few times
/// on conflicting writes; missing records are fine.
pub async fn release_instance<S: Store>(
    store: &S,
    instance_id: &str,
    to_status: InstanceStatus,
    now: i64,
) -> Result<(), SvcError> {
    for _ in 0 .. 3 {
        let record: Option<InstanceRecord> = store
            .find_obj(&InstanceRecordKey::from(instance_id))
            .await?;
        let record = match record {
            Some(record) => record,
            None => return Ok(()),
        };
        let released = record.released(to_status, now);
        if store
            .compare_and_put(&record, &released)
            .await?
            .committed()
        {
            tracing::info!(
                instance.id = instance_id,
                status = %to_status,
                "Released instance"
            );
            return Ok(());
        }
    }
    tracing::warn!(
        instance.id = instance_id,
        "Gave up releasing instance after repeated write conflicts"
    );
    Ok(())
}

/// All sessions of one owner, newest first.
pub async fn sessions_for_owner<S: Store>(
    store: &S,
    owner_id: &str,
) -> Result<Vec<Session>, SvcError> {
    let sessions: Vec<Session> = store.get_prefix(StorableObjectType::Session).await?;
    let mut sessions: Vec<Session> = sessions
        .into_iter()
        .filter(|session| session.owner_id == owner_id)
        .collect();
    sessions.sort_by_key(|session| std::cmp::Reverse(session.created_at));
    Ok(sessions)
}

/// All sessions currently counting against the owner's session limit.
pub async fn in_flight_sessions_for_owner<S: Store>(
    store: &S,
    owner_id: &str,
) -> Result<Vec<Session>, SvcError> {
    Ok(sessions_for_owner(store, owner_id)
        .await?
        .into_iter()
        .filter(|session| session.status.in_flight())
        .collect())
}

/// Sessions are only revived while non-terminal: guard the write with the
/// observed value so a concurrent terminate wins.
pub async fn persist_if_not_terminated<S: Store>(
    store: &S,
    observed: &Session,
    updated: &Session,
) -> Result<(), SvcError> {
    match store.compare_and_put(observed, updated).await? {
        CasOutcome::Committed => Ok(()),
        CasOutcome::Conflict => {
            // re-read: only push our update if the session is still live
            let current: Option<Session> =
                store.find_obj(&SessionKey::from(&observed.session_id)).await?;
            match current {
                Some(current) if !current.status.terminal() => {
                    store.put_obj(updated).await?;
                    Ok(())
                }
                _ => {
                    tracing::debug!(
                        session.id = %observed.session_id,
                        "Skipping update of a terminated session"
                    );
                    Ok(())
                }
            }
        }
    }
}
