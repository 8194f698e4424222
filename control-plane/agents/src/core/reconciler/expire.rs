//! Pass 1: terminate sessions past their TTL.

use super::terminate_and_release;
use crate::core::task_poller::{PollContext, PollResult, PollTimer, PollerState, TaskPoller};
use labpool_common::{
    now_ts,
    store::definitions::{StorableObjectType, Store},
    types::session::{Session, TerminationReason},
};

pub struct ExpiredSessionPoller {
    counter: PollTimer,
}

impl ExpiredSessionPoller {
    pub fn new() -> Self {
        Self {
            counter: PollTimer::from(1),
        }
    }
}

#[async_trait::async_trait]
impl<S: Store> TaskPoller<S> for ExpiredSessionPoller {
    async fn poll(&mut self, context: &PollContext<S>) -> PollResult {
        expire_sessions(context, now_ts()).await
    }

    async fn poll_timer(&mut self, _context: &PollContext<S>) -> bool {
        self.counter.poll()
    }
}

#[tracing::instrument(skip(context), fields(request.reconcile = true))]
pub(crate) async fn expire_sessions<S: Store>(context: &PollContext<S>, now: i64) -> PollResult {
    let sessions: Vec<Session> = context
        .store()
        .get_prefix(StorableObjectType::Session)
        .await?;
    let mut failures = 0;
    for session in sessions
        .iter()
        .filter(|session| session.status.in_flight() && session.expires_at <= now)
    {
        if let Err(error) =
            terminate_and_release(context, session, TerminationReason::Expired, now).await
        {
            tracing::error!(
                session.id = %session.session_id,
                %error,
                "Failed to expire session"
            );
            failures += 1;
        }
    }
    if failures > 0 {
        Ok(PollerState::Busy)
    } else {
        Ok(PollerState::Idle)
    }
}
