//! Reconciler convergence scenarios: expiry, idle sweep, pool sync, orphan
//! release and tier scaling, each driven through full cycles of the loop.

mod harness;

use harness::*;
use labpool_agents::core::reconciler::ReconcilerLoop;
use labpool_common::{
    cloud::InstanceState,
    now_ts,
    store::definitions::{Store, StorableObjectType},
    types::{
        instance::{InstanceRecord, InstanceRecordKey, InstanceStatus},
        plan::PlanTier,
        session::{SessionId, SessionStatus, TerminationReason},
    },
};
use std::time::Duration;

fn reconciler(harness: &Harness) -> ReconcilerLoop<labpool_common::store::memory::InMemoryStore> {
    ReconcilerLoop::new(&harness.registry, Duration::from_secs(60))
}

async fn seed_assigned_instance(
    harness: &Harness,
    instance_id: &str,
    plan: PlanTier,
    session_id: Option<&SessionId>,
    assigned_at: i64,
) {
    harness.cloud.add_instance(
        &group_for(plan),
        instance_id,
        InstanceState::Running,
        "10.0.3.3",
    );
    harness
        .store
        .put_obj(&InstanceRecord {
            instance_id: instance_id.to_string(),
            status: InstanceStatus::Assigned,
            plan,
            session_id: session_id.cloned(),
            owner_id: session_id.map(|_| "someone".to_string()),
            assigned_at: Some(assigned_at),
            ..Default::default()
        })
        .await
        .unwrap();
}

// S5: one cycle expires the overdue session, releases its instance, and
// frees the instance whose session no longer exists.
#[tokio::test]
async fn cycle_expires_sessions_and_releases_orphans() {
    let harness = harness();
    let now = now_ts();

    let mut expired = ready_session("u-exp", PlanTier::Pro, None);
    expired.status = SessionStatus::Active;
    expired.created_at = now - 3600;
    expired.expires_at = now - 10;
    expired.instance_id = Some("i-C".to_string());
    seed_session(&harness, &expired).await;
    seed_assigned_instance(&harness, "i-C", PlanTier::Pro, Some(&expired.session_id), now - 3600)
        .await;

    let missing = SessionId::from("sess-missing");
    seed_assigned_instance(&harness, "i-D", PlanTier::Pro, Some(&missing), now - 3600).await;

    reconciler(&harness).poll_once().await.unwrap();

    let expired_stored = stored_session(&harness, &expired.session_id).await;
    assert_eq!(expired_stored.status, SessionStatus::Terminated);
    assert_eq!(
        expired_stored.termination_reason,
        Some(TerminationReason::Expired)
    );

    for instance_id in ["i-C", "i-D"] {
        let record = stored_instance(&harness, instance_id).await;
        assert_eq!(record.status, InstanceStatus::Available, "{}", instance_id);
        assert!(record.session_id.is_none());
        assert!(record.owner_id.is_none());
    }

    // the hour of runtime was billed
    let stats = harness
        .service
        .usage()
        .stats("u-exp", PlanTier::Pro, -1, now)
        .await
        .unwrap();
    assert_eq!(stats.consumed_minutes, 60);
}

// P7(iii): pool membership converges on group membership, per tier.
#[tokio::test]
async fn pool_sync_converges_on_group_membership() {
    let harness = harness();
    let group = group_for(PlanTier::Starter);

    // a running member with no pool record, and a stopped one
    harness
        .cloud
        .add_instance(&group, "i-new", InstanceState::Running, "10.0.4.1");
    harness
        .cloud
        .add_instance(&group, "i-warm", InstanceState::Stopped, "10.0.4.2");
    // a record whose instance left the group
    harness
        .store
        .put_obj(&InstanceRecord {
            instance_id: "i-gone".to_string(),
            status: InstanceStatus::Available,
            plan: PlanTier::Starter,
            ..Default::default()
        })
        .await
        .unwrap();
    // a starting record whose instance is now running
    harness
        .cloud
        .add_instance(&group, "i-up", InstanceState::Running, "10.0.4.3");
    harness
        .store
        .put_obj(&InstanceRecord {
            instance_id: "i-up".to_string(),
            status: InstanceStatus::Starting,
            plan: PlanTier::Starter,
            ..Default::default()
        })
        .await
        .unwrap();

    reconciler(&harness).poll_once().await.unwrap();

    assert_eq!(
        stored_instance(&harness, "i-new").await.status,
        InstanceStatus::Available
    );
    assert_eq!(
        stored_instance(&harness, "i-warm").await.status,
        InstanceStatus::Available
    );
    assert_eq!(
        stored_instance(&harness, "i-up").await.status,
        InstanceStatus::Available
    );
    let gone: Option<InstanceRecord> = harness
        .store
        .find_obj(&InstanceRecordKey::from("i-gone"))
        .await
        .unwrap();
    assert!(gone.is_none(), "departed instances are dropped");
}

// Idle sweep: an idle session is warned first, then terminated once past
// the tier threshold, with the warning clearing when activity resumes (B4).
#[tokio::test]
async fn idle_sweep_warns_then_terminates_with_hysteresis() {
    let harness = harness();
    let now = now_ts();

    // freemium thresholds: warn 15 min, terminate 30 min
    let mut session = ready_session("u-idle", PlanTier::Freemium, Some("c-idle"));
    session.status = SessionStatus::Active;
    session.instance_id = Some("i-I".to_string());
    session.last_active_at = Some(now - 20 * 60);
    seed_session(&harness, &session).await;
    seed_assigned_instance(
        &harness,
        "i-I",
        PlanTier::Freemium,
        Some(&session.session_id),
        now - 3600,
    )
    .await;

    reconciler(&harness).poll_once().await.unwrap();
    let warned = stored_session(&harness, &session.session_id).await;
    assert_eq!(warned.status, SessionStatus::Active);
    assert!(warned.idle_warning_sent_at.is_some(), "warning recorded");

    // activity resumes (gateway shows the user connected): warning clears
    harness.gateway.set_active("c-idle", now);
    reconciler(&harness).poll_once().await.unwrap();
    let cleared = stored_session(&harness, &session.session_id).await;
    assert!(cleared.idle_warning_sent_at.is_none(), "warning cleared");

    // user disconnects and the idle clock runs past termination
    harness.gateway.clear_active("c-idle");
    let mut long_idle = cleared.clone();
    long_idle.last_active_at = Some(now - 31 * 60);
    long_idle.last_heartbeat_at = None;
    harness.store.put_obj(&long_idle).await.unwrap();

    reconciler(&harness).poll_once().await.unwrap();
    let terminated = stored_session(&harness, &session.session_id).await;
    assert_eq!(terminated.status, SessionStatus::Terminated);
    assert_eq!(
        terminated.termination_reason,
        Some(TerminationReason::IdleTimeout)
    );
    let record = stored_instance(&harness, "i-I").await;
    assert_eq!(record.status, InstanceStatus::Available);
    // idle terminations are tagged with the reason
    let tags = harness.cloud.tags("i-I");
    assert_eq!(tags.get("TerminationReason"), Some(&"idle_timeout".to_string()));
}

// Focus mode exempts a session from the idle sweep entirely.
#[tokio::test]
async fn focus_mode_suppresses_idle_termination() {
    let harness = harness();
    let now = now_ts();
    let mut session = ready_session("u-focus", PlanTier::Freemium, Some("c-f"));
    session.status = SessionStatus::Active;
    session.focus_mode = true;
    session.last_active_at = Some(now - 2 * 3600);
    seed_session(&harness, &session).await;

    reconciler(&harness).poll_once().await.unwrap();
    let stored = stored_session(&harness, &session.session_id).await;
    assert_eq!(stored.status, SessionStatus::Active);
    assert!(stored.idle_warning_sent_at.is_none());
}

// B3: scale-up never raises desired capacity by more than two per cycle,
// and only while nothing is already starting.
#[tokio::test]
async fn scale_up_is_capped_and_skipped_while_starting() {
    let harness = harness();
    let group = group_for(PlanTier::Pro);
    harness.cloud.set_capacity(&group, 0, 10, 0);

    for i in 0 .. 5 {
        let mut session = ready_session(&format!("u-s{}", i), PlanTier::Pro, None);
        session.status = SessionStatus::Provisioning;
        seed_session(&harness, &session).await;
    }

    reconciler(&harness).poll_once().await.unwrap();
    assert_eq!(harness.cloud.desired(&group), 2, "capped at +2");

    // with an instance starting, the next cycle holds steady
    harness
        .store
        .put_obj(&InstanceRecord {
            instance_id: "i-starting".to_string(),
            status: InstanceStatus::Starting,
            plan: PlanTier::Pro,
            ..Default::default()
        })
        .await
        .unwrap();
    harness
        .cloud
        .add_instance(&group, "i-starting", InstanceState::Pending, "10.0.5.1");
    reconciler(&harness).poll_once().await.unwrap();
    assert_eq!(harness.cloud.desired(&group), 2, "no oscillation");
}

// Scale-down drains one instance at a time, only when the tier is idle.
#[tokio::test]
async fn idle_tier_scales_down_one_step() {
    let harness = harness();
    let group = group_for(PlanTier::Freemium);
    harness.cloud.set_capacity(&group, 0, 10, 4);
    for i in 0 .. 3 {
        seed_available_instance(
            &harness,
            &format!("i-a{}", i),
            PlanTier::Freemium,
            "10.0.6.1",
        )
        .await;
    }

    reconciler(&harness).poll_once().await.unwrap();
    assert_eq!(harness.cloud.desired(&group), 3);

    // an active session stops the drain
    let session = ready_session("u-active", PlanTier::Freemium, None);
    seed_session(&harness, &session).await;
    reconciler(&harness).poll_once().await.unwrap();
    assert_eq!(harness.cloud.desired(&group), 3);
}

// Stale assignments (old claim, silent session) are orphaned after an hour.
#[tokio::test]
async fn silent_sessions_lose_their_instance_after_an_hour() {
    let harness = harness();
    let now = now_ts();
    let mut quiet = ready_session("u-quiet", PlanTier::Pro, None);
    quiet.created_at = now - 2 * 3600;
    quiet.updated_at = now - 2 * 3600;
    quiet.expires_at = now + 3600;
    // recently active, so the idle sweep leaves it alone; the orphan pass
    // keys off the stale store record instead
    quiet.last_active_at = Some(now);
    quiet.instance_id = Some("i-Q".to_string());
    seed_session(&harness, &quiet).await;
    seed_assigned_instance(&harness, "i-Q", PlanTier::Pro, Some(&quiet.session_id), now - 2 * 3600)
        .await;

    reconciler(&harness).poll_once().await.unwrap();
    assert_eq!(
        stored_instance(&harness, "i-Q").await.status,
        InstanceStatus::Available
    );

    // a fresh assignment is left alone
    let mut fresh = ready_session("u-fresh", PlanTier::Pro, None);
    fresh.instance_id = Some("i-R".to_string());
    seed_session(&harness, &fresh).await;
    seed_assigned_instance(&harness, "i-R", PlanTier::Pro, Some(&fresh.session_id), now).await;
    reconciler(&harness).poll_once().await.unwrap();
    assert_eq!(
        stored_instance(&harness, "i-R").await.status,
        InstanceStatus::Assigned
    );
}

// P7(i): after one cycle nothing in-flight remains past its expiry.
#[tokio::test]
async fn no_in_flight_session_survives_expiry() {
    let harness = harness();
    let now = now_ts();
    for (i, status) in [
        SessionStatus::Pending,
        SessionStatus::Provisioning,
        SessionStatus::Ready,
        SessionStatus::Active,
    ]
    .iter()
    .enumerate()
    {
        let mut session = ready_session(&format!("u-e{}", i), PlanTier::Starter, None);
        session.status = *status;
        session.created_at = now - 7200;
        session.expires_at = now - 1;
        seed_session(&harness, &session).await;
    }

    reconciler(&harness).poll_once().await.unwrap();

    let sessions: Vec<labpool_common::types::session::Session> = harness
        .store
        .get_prefix(StorableObjectType::Session)
        .await
        .unwrap();
    for session in sessions {
        assert_eq!(session.status, SessionStatus::Terminated);
        assert!(session.expires_at <= now);
    }
}
