//! Pass 4: release assigned instances whose session is gone, finished, or
//! silent for over an hour.

use crate::core::{
    session::allocation,
    task_poller::{PollContext, PollResult, PollTimer, PollerState, TaskPoller},
};
use labpool_common::{
    now_ts,
    store::definitions::{StorableObjectType, Store},
    types::{
        instance::{InstanceRecord, InstanceStatus},
        session::{Session, SessionKey},
    },
};

/// Assignments older than this with a silent session are considered leaked.
const STALE_ASSIGNMENT_SECS: i64 = 3600;

pub struct OrphanPoller {
    counter: PollTimer,
}

impl OrphanPoller {
    pub fn new() -> Self {
        Self {
            counter: PollTimer::from(1),
        }
    }
}

#[async_trait::async_trait]
impl<S: Store> TaskPoller<S> for OrphanPoller {
    async fn poll(&mut self, context: &PollContext<S>) -> PollResult {
        release_orphans(context, now_ts()).await
    }

    async fn poll_timer(&mut self, _context: &PollContext<S>) -> bool {
        self.counter.poll()
    }
}

async fn is_orphaned<S: Store>(
    context: &PollContext<S>,
    record: &InstanceRecord,
    now: i64,
) -> Result<bool, crate::errors::SvcError> {
    let session_id = match &record.session_id {
        None => return Ok(true),
        Some(session_id) => session_id,
    };
    let session: Option<Session> = context
        .store()
        .find_obj(&SessionKey::from(session_id))
        .await?;
    let session = match session {
        None => return Ok(true),
        Some(session) => session,
    };
    if session.status.terminal() {
        return Ok(true);
    }
    let assigned_long_ago = record
        .assigned_at
        .map(|at| now - at > STALE_ASSIGNMENT_SECS)
        .unwrap_or(false);
    Ok(assigned_long_ago && now - session.updated_at > STALE_ASSIGNMENT_SECS)
}

#[tracing::instrument(skip(context), fields(request.reconcile = true))]
pub(crate) async fn release_orphans<S: Store>(context: &PollContext<S>, now: i64) -> PollResult {
    let records: Vec<InstanceRecord> = context
        .store()
        .get_prefix(StorableObjectType::Instance)
        .await?;
    for record in records
        .iter()
        .filter(|record| record.status == InstanceStatus::Assigned)
    {
        if !is_orphaned(context, record, now).await? {
            continue;
        }
        tracing::info!(
            instance.id = %record.instance_id,
            session.id = ?record.session_id,
            "Releasing orphaned instance"
        );
        allocation::release_instance(
            context.store(),
            &record.instance_id,
            InstanceStatus::Available,
            now,
        )
        .await?;
        allocation::clear_claim_tags(
            context.registry().cloud().as_ref(),
            &record.instance_id,
            None,
        )
        .await;
    }
    Ok(PollerState::Idle)
}
