//! Pass 2: detect idle sessions from the union of client heartbeats and
//! gateway activity. Warn first, terminate later, clear the warning when
//! activity resumes. One `active_connections` call covers the whole cycle.

use super::terminate_and_release;
use crate::core::{
    session::allocation,
    task_poller::{PollContext, PollResult, PollTimer, PollerState, TaskPoller},
};
use labpool_common::{
    gateway::ActiveConnection,
    now_ts,
    store::definitions::{StorableObjectType, Store},
    types::session::{Session, SessionStatus, TerminationReason},
};
use std::collections::HashMap;

pub struct IdleSessionPoller {
    counter: PollTimer,
}

impl IdleSessionPoller {
    pub fn new() -> Self {
        Self {
            counter: PollTimer::from(1),
        }
    }
}

#[async_trait::async_trait]
impl<S: Store> TaskPoller<S> for IdleSessionPoller {
    async fn poll(&mut self, context: &PollContext<S>) -> PollResult {
        sweep_idle(context, now_ts()).await
    }

    async fn poll_timer(&mut self, _context: &PollContext<S>) -> bool {
        self.counter.poll()
    }
}

fn connection_activity(
    session: &Session,
    active: &HashMap<String, Vec<ActiveConnection>>,
) -> (bool, i64) {
    match session.gateway_connection_id() {
        None => (false, 0),
        Some(connection_id) => match active.get(connection_id) {
            None => (false, 0),
            Some(sessions) => (
                !sessions.is_empty(),
                sessions.iter().filter_map(|s| s.start_time).max().unwrap_or(0),
            ),
        },
    }
}

#[tracing::instrument(skip(context), fields(request.reconcile = true))]
pub(crate) async fn sweep_idle<S: Store>(context: &PollContext<S>, now: i64) -> PollResult {
    let config = context.registry().config();
    if !config.enable_idle_detection {
        return Ok(PollerState::Idle);
    }

    // one gateway round-trip fans out across every session below
    let active = match context.registry().gateway_probe().active_connections().await {
        Ok(active) => active,
        Err(error) => {
            tracing::warn!(%error, "Gateway activity feed unavailable, skipping idle sweep");
            return Ok(PollerState::Idle);
        }
    };

    let sessions: Vec<Session> = context
        .store()
        .get_prefix(StorableObjectType::Session)
        .await?;
    for session in sessions.iter().filter(|session| {
        matches!(
            session.status,
            SessionStatus::Ready | SessionStatus::Active
        ) && !session.focus_mode
    }) {
        let (connected, gateway_last_activity) = connection_activity(session, &active);
        let mut effective_last_active = session.last_seen().max(gateway_last_activity);
        if connected {
            effective_last_active = now;
        }
        let idle = (now - effective_last_active).max(0);

        let (warning, termination) = config.idle_thresholds(session.plan);
        let warning_threshold = warning.as_secs() as i64;
        let termination_threshold = termination.as_secs() as i64;

        if idle >= termination_threshold {
            if let Err(error) =
                terminate_and_release(context, session, TerminationReason::IdleTimeout, now).await
            {
                tracing::error!(
                    session.id = %session.session_id,
                    %error,
                    "Failed to terminate idle session"
                );
            }
        } else if idle >= warning_threshold && session.idle_warning_sent_at.is_none() {
            let mut warned = session.clone();
            warned.idle_warning_sent_at = Some(now);
            warned.updated_at = now;
            allocation::persist_if_not_terminated(context.store(), session, &warned).await?;
            tracing::info!(
                session.id = %session.session_id,
                idle,
                "Session entered idle warning"
            );
        } else if idle < warning_threshold && session.idle_warning_sent_at.is_some() {
            // hysteresis: activity resumed, arm the warning again
            let mut cleared = session.clone();
            cleared.idle_warning_sent_at = None;
            cleared.updated_at = now;
            allocation::persist_if_not_terminated(context.store(), session, &cleared).await?;
        }
    }
    Ok(PollerState::Idle)
}
