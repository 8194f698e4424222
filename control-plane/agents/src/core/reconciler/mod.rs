//! The periodic control loop converging store contents with cloud ground
//! truth. Five passes run in order each cycle; expiry must precede the
//! orphan pass so an instance is never released out from under a session the
//! expiry pass was about to reap itself.

pub mod expire;
pub mod idle;
pub mod orphan;
pub mod pool_sync;
pub mod scaling;

use crate::{
    core::{
        registry::Registry,
        session::allocation,
        task_poller::{squash_results, PollContext, PollResult, PollerState, TaskPoller},
        usage::UsageLedger,
    },
    errors::SvcError,
};
use labpool_common::{
    store::definitions::Store,
    types::{
        instance::InstanceStatus,
        session::{Session, TerminationReason},
    },
};
use std::time::Duration;

/// The reconciler: runs every period, skipping a cycle rather than piling up
/// when a pass takes longer than the interval.
pub struct ReconcilerLoop<S: Store> {
    context: PollContext<S>,
    period: Duration,
    pollers: Vec<Box<dyn TaskPoller<S>>>,
}

impl<S: Store> ReconcilerLoop<S> {
    pub fn new(registry: &Registry<S>, period: Duration) -> Self {
        Self {
            context: PollContext::from(registry),
            period,
            pollers: vec![
                Box::new(expire::ExpiredSessionPoller::new()),
                Box::new(idle::IdleSessionPoller::new()),
                Box::new(pool_sync::PoolSyncPoller::new()),
                Box::new(orphan::OrphanPoller::new()),
                Box::new(scaling::TierScalingPoller::new()),
            ],
        }
    }

    /// One full cycle, all passes in order. Exposed for tests.
    pub async fn poll_once(&mut self) -> PollResult {
        let mut results = Vec::with_capacity(self.pollers.len());
        for poller in &mut self.pollers {
            let result = poller.try_poll(&self.context).await;
            if let Err(error) = &result {
                tracing::error!(%error, "Reconciler pass failed");
            }
            results.push(result);
        }
        squash_results(results)
    }

    /// Run forever on the configured cadence.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.poll_once().await {
                Ok(PollerState::Busy) => tracing::debug!("Reconcile cycle left work behind"),
                Ok(PollerState::Idle) => {}
                Err(error) => tracing::error!(%error, "Reconcile cycle failed"),
            }
        }
    }
}

/// Terminate a session from a reconciler pass: account its usage, mark it
/// terminated and hand its workstation back to the pool.
pub(crate) async fn terminate_and_release<S: Store>(
    context: &PollContext<S>,
    session: &Session,
    reason: TerminationReason,
    now: i64,
) -> Result<(), SvcError> {
    let ledger = UsageLedger::new(context.store().clone());
    if let Err(error) = ledger
        .record_session(
            &session.owner_id,
            session.created_at,
            now,
            session.plan,
            session.plan.default_quota_minutes(),
        )
        .await
    {
        tracing::warn!(session.id = %session.session_id, %error, "Failed to record usage");
    }

    let mut terminated = session.clone();
    terminated.terminate(reason, now);
    context.store().put_obj(&terminated).await?;

    if let Some(instance_id) = &session.instance_id {
        allocation::release_instance(
            context.store(),
            instance_id,
            InstanceStatus::Available,
            now,
        )
        .await?;
        let tag_reason = match reason {
            TerminationReason::IdleTimeout => Some("idle_timeout"),
            _ => None,
        };
        allocation::clear_claim_tags(
            context.registry().cloud().as_ref(),
            instance_id,
            tag_reason,
        )
        .await;
    }
    tracing::info!(
        session.id = %session.session_id,
        reason = %reason,
        "Reconciler terminated session"
    );
    Ok(())
}
