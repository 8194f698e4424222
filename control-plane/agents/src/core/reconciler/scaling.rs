//! Pass 5: demand-driven capacity per tier. Scale up only while nothing is
//! already starting (avoids oscillation), step down one at a time when the
//! tier is idle.

use crate::core::task_poller::{PollContext, PollResult, PollTimer, PollerState, TaskPoller};
use labpool_common::{
    store::definitions::{StorableObjectType, Store},
    types::{
        instance::{InstanceRecord, InstanceStatus},
        plan::PlanTier,
        session::Session,
    },
};

/// Per-cycle cap on how many instances a tier may add.
const MAX_SCALE_UP_STEP: i64 = 2;
/// Keep this many instances warm before considering a scale-down.
const SCALE_DOWN_SURPLUS: usize = 2;

pub struct TierScalingPoller {
    counter: PollTimer,
}

impl TierScalingPoller {
    pub fn new() -> Self {
        Self {
            counter: PollTimer::from(1),
        }
    }
}

#[async_trait::async_trait]
impl<S: Store> TaskPoller<S> for TierScalingPoller {
    async fn poll(&mut self, context: &PollContext<S>) -> PollResult {
        scale_tiers(context).await
    }

    async fn poll_timer(&mut self, _context: &PollContext<S>) -> bool {
        self.counter.poll()
    }
}

struct TierDemand {
    active: i64,
    pooled: i64,
    starting: usize,
    available: usize,
}

fn demand_for(sessions: &[Session], records: &[InstanceRecord], plan: PlanTier) -> TierDemand {
    let active = sessions
        .iter()
        .filter(|session| session.plan == plan && session.status.in_flight())
        .count() as i64;
    let of_plan = || records.iter().filter(move |record| record.plan == plan);
    let available = of_plan()
        .filter(|record| record.status == InstanceStatus::Available)
        .count();
    let starting = of_plan()
        .filter(|record| record.status == InstanceStatus::Starting)
        .count();
    let assigned = of_plan()
        .filter(|record| record.status == InstanceStatus::Assigned)
        .count();
    TierDemand {
        active,
        pooled: (available + starting + assigned) as i64,
        starting,
        available,
    }
}

#[tracing::instrument(skip(context), fields(request.reconcile = true))]
pub(crate) async fn scale_tiers<S: Store>(context: &PollContext<S>) -> PollResult {
    let cloud = context.registry().cloud();
    let sessions: Vec<Session> = context
        .store()
        .get_prefix(StorableObjectType::Session)
        .await?;
    let records: Vec<InstanceRecord> = context
        .store()
        .get_prefix(StorableObjectType::Instance)
        .await?;

    for tier in context.registry().config().deployed_tiers() {
        let demand = demand_for(&sessions, &records, tier.plan);
        let capacity = match cloud.group_capacity(&tier.group_name).await {
            Ok(capacity) => capacity,
            Err(error) => {
                tracing::warn!(group = %tier.group_name, %error, "Capacity lookup failed");
                continue;
            }
        };
        tracing::debug!(
            plan = %tier.plan,
            active = demand.active,
            pooled = demand.pooled,
            desired = capacity.desired,
            "Scaling check"
        );

        if demand.active > demand.pooled
            && demand.starting == 0
            && capacity.desired < capacity.max
        {
            let step = (demand.active - demand.pooled).min(MAX_SCALE_UP_STEP) as u32;
            let new_desired = (capacity.desired + step).min(capacity.max);
            if let Err(error) = cloud.set_desired(&tier.group_name, new_desired).await {
                tracing::warn!(group = %tier.group_name, %error, "Scale-up failed");
            } else {
                tracing::info!(
                    group = %tier.group_name,
                    desired = new_desired,
                    "Scaled tier up"
                );
            }
        } else if demand.available > SCALE_DOWN_SURPLUS
            && demand.active == 0
            && capacity.desired > capacity.min
        {
            let new_desired = capacity.desired - 1;
            if let Err(error) = cloud.set_desired(&tier.group_name, new_desired).await {
                tracing::warn!(group = %tier.group_name, %error, "Scale-down failed");
            } else {
                tracing::info!(
                    group = %tier.group_name,
                    desired = new_desired,
                    "Scaled idle tier down"
                );
            }
        }
    }
    Ok(PollerState::Idle)
}
