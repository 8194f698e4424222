//! End-to-end scenarios for the session request path, run against the
//! in-memory store and the mock cloud/gateway ports.

mod harness;

use harness::*;
use labpool_agents::{
    core::session::{CreateSessionBody, CreateSessionRequest, HeartbeatBody, TerminateBody},
    errors::SvcError,
};
use labpool_common::{
    now_ts,
    store::definitions::Store,
    types::{
        instance::InstanceStatus,
        plan::PlanTier,
        session::{SessionId, SessionStatus, TerminationReason},
    },
};

fn body_request(owner: &str, plan: PlanTier) -> CreateSessionRequest {
    CreateSessionRequest {
        token: None,
        body: CreateSessionBody {
            owner_id: Some(owner.to_string()),
            display_name: Some(format!("User {}", owner)),
            plan: Some(plan),
            metadata: Default::default(),
        },
    }
}

// Happy path on a warm pool instance: token-authenticated request ends up
// ready on the seeded instance with a tokenized viewer URL.
#[tokio::test]
async fn create_session_happy_path_claims_warm_instance() {
    let harness = harness_with(|config| {
        config.portal_secret = Some(PORTAL_SECRET.to_string());
        config.require_auth = true;
    });
    seed_available_instance(&harness, "i-A", PlanTier::Pro, "10.0.0.5").await;

    let request = CreateSessionRequest {
        token: Some(forge_token(portal_claims("u1", "pro", -1, "n-s1"))),
        body: CreateSessionBody::default(),
    };
    let view = harness.service.create_session(request).await.unwrap();

    assert_eq!(view.status, SessionStatus::Ready);
    assert_eq!(view.instance_id.as_deref(), Some("i-A"));
    let info = view.connection_info.expect("connection info");
    assert_eq!(info.instance_ip, "10.0.0.5");
    assert_eq!(info.ports.rdp, 3389);
    let direct_url = info.direct_url.expect("direct url");
    assert!(direct_url.starts_with(&format!("{}/?token=", PUBLIC_BASE)));
    assert!(direct_url.contains("#/client/"));
    // the token precedes the fragment
    assert!(direct_url.find("?token=").unwrap() < direct_url.find('#').unwrap());

    // pool row is claimed by the new session
    let record = stored_instance(&harness, "i-A").await;
    assert_eq!(record.status, InstanceStatus::Assigned);
    assert_eq!(
        record.session_id.as_ref().map(|id| id.to_string()),
        Some(view.session_id.clone())
    );
    assert_eq!(record.owner_id.as_deref(), Some("u1"));

    // claim tags landed on the instance
    let tags = harness.cloud.tags("i-A");
    assert_eq!(tags.get("SessionId"), Some(&view.session_id));
    assert_eq!(tags.get("OwnerId"), Some(&"u1".to_string()));
}

// Two concurrent requests race for one instance: exactly one wins it, the
// other ends up provisioning behind a scale-up.
#[tokio::test]
async fn concurrent_claims_on_one_instance_yield_one_winner() {
    let harness = harness();
    seed_available_instance(&harness, "i-B", PlanTier::Pro, "10.0.0.7").await;

    let (first, second) = tokio::join!(
        harness.service.create_session(body_request("u2", PlanTier::Pro)),
        harness.service.create_session(body_request("u3", PlanTier::Pro)),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    let candidates = [&first, &second];
    let mut ready: Vec<_> = candidates
        .iter()
        .filter(|view| view.status == SessionStatus::Ready)
        .collect();
    assert_eq!(ready.len(), 1, "exactly one claim must win");
    let winner = ready.pop().unwrap();
    assert_eq!(winner.instance_id.as_deref(), Some("i-B"));

    let loser = if first.session_id == winner.session_id {
        &second
    } else {
        &first
    };
    assert_eq!(loser.status, SessionStatus::Provisioning);
    // the loser triggered a scale-up
    assert!(harness.cloud.desired(&group_for(PlanTier::Pro)) > 0);

    let record = stored_instance(&harness, "i-B").await;
    assert_eq!(record.status, InstanceStatus::Assigned);
    assert_eq!(
        record.session_id.as_ref().map(|id| id.to_string()),
        Some(winner.session_id.clone())
    );
}

// Quota exhausted: 403 with remaining zero and the reset instant.
#[tokio::test]
async fn quota_exceeded_is_rejected_with_reset_time() {
    let harness = harness_with(|config| {
        config.portal_secret = Some(PORTAL_SECRET.to_string());
        config.require_auth = true;
    });
    harness
        .service
        .usage()
        .add_minutes("u4", 300, PlanTier::Freemium, 300, now_ts())
        .await
        .unwrap();

    let request = CreateSessionRequest {
        token: Some(forge_token(portal_claims("u4", "freemium", 300, "n-s3"))),
        body: CreateSessionBody::default(),
    };
    let error = harness.service.create_session(request).await.unwrap_err();
    match error {
        SvcError::QuotaExceeded {
            plan,
            consumed,
            quota,
            resets_at,
        } => {
            assert_eq!(plan, PlanTier::Freemium);
            assert_eq!(consumed, 300);
            assert_eq!(quota, 300);
            let resets_at = resets_at.expect("reset instant");
            assert!(resets_at.ends_with("T00:00:00+00:00"), "{}", resets_at);
        }
        other => panic!("expected quota error, got {:?}", other),
    }
}

// A stale session (user logged out of the gateway long ago) is reaped and
// its instance immediately re-claimed by the new session.
#[tokio::test]
async fn stale_session_is_reaped_and_instance_recycled() {
    let harness = harness();
    seed_available_instance(&harness, "i-X", PlanTier::Pro, "10.0.0.9").await;

    let mut old = ready_session("u5", PlanTier::Pro, Some("c1"));
    old.instance_id = Some("i-X".to_string());
    old.instance_ip = Some("10.0.0.9".to_string());
    old.last_active_at = Some(now_ts() - 3600);
    seed_session(&harness, &old).await;
    // pool row reflects the old claim
    let claimed = stored_instance(&harness, "i-X")
        .await
        .assigned_to(&old.session_id, "u5", now_ts() - 3600);
    harness.store.put_obj(&claimed).await.unwrap();
    // gateway reports nobody connected to c1

    let view = harness
        .service
        .create_session(body_request("u5", PlanTier::Pro))
        .await
        .unwrap();

    assert_ne!(view.session_id, old.session_id.to_string());
    assert_eq!(view.status, SessionStatus::Ready);
    assert_eq!(view.instance_id.as_deref(), Some("i-X"));

    let old_stored = stored_session(&harness, &old.session_id).await;
    assert_eq!(old_stored.status, SessionStatus::Terminated);
    assert_eq!(
        old_stored.termination_reason,
        Some(TerminationReason::StaleGatewayLogout)
    );

    let record = stored_instance(&harness, "i-X").await;
    assert_eq!(record.status, InstanceStatus::Assigned);
    assert_eq!(
        record.session_id.as_ref().map(|id| id.to_string()),
        Some(view.session_id)
    );
}

// A connected user keeps their session: the duplicate request reuses it.
#[tokio::test]
async fn connected_session_is_reused() {
    let harness = harness();
    let mut existing = ready_session("u6", PlanTier::Starter, Some("c9"));
    existing.instance_id = Some("i-S".to_string());
    seed_session(&harness, &existing).await;
    harness.gateway.set_active("c9", now_ts() - 60);

    let view = harness
        .service
        .create_session(body_request("u6", PlanTier::Starter))
        .await
        .unwrap();
    assert_eq!(view.session_id, existing.session_id.to_string());
    assert_eq!(view.reused, Some(true));
}

// Cold start at max capacity: 503 and an error session record.
#[tokio::test]
async fn capacity_exhaustion_writes_error_session() {
    let harness = harness();
    let group = group_for(PlanTier::Freemium);
    harness.cloud.set_capacity(&group, 0, 2, 2);
    // two running members, both assigned to live sessions
    for (instance_id, owner) in [("i-1", "o1"), ("i-2", "o2")] {
        harness.cloud.add_instance(
            &group,
            instance_id,
            labpool_common::cloud::InstanceState::Running,
            "10.0.1.1",
        );
        let mut session = ready_session(owner, PlanTier::Freemium, None);
        session.instance_id = Some(instance_id.to_string());
        seed_session(&harness, &session).await;
        let record = labpool_common::types::instance::InstanceRecord {
            instance_id: instance_id.to_string(),
            status: InstanceStatus::Assigned,
            plan: PlanTier::Freemium,
            session_id: Some(session.session_id.clone()),
            owner_id: Some(owner.to_string()),
            assigned_at: Some(now_ts()),
            ..Default::default()
        };
        harness.store.put_obj(&record).await.unwrap();
    }

    let error = harness
        .service
        .create_session(body_request("u7", PlanTier::Freemium))
        .await
        .unwrap_err();
    assert!(matches!(error, SvcError::CapacityExhausted { .. }));

    // the session record survives as the error trail
    let sessions = harness
        .service
        .sessions_for_owner("u7")
        .await
        .unwrap();
    assert_eq!(sessions.total_sessions, 1);
    let failed = &sessions.sessions[0];
    assert_eq!(failed.status, SessionStatus::Error);
    assert_eq!(failed.error.as_deref(), Some("capacity"));
}

// Warm pool: a stopped group member is started and the session provisions.
#[tokio::test]
async fn stopped_group_member_is_started_for_the_session() {
    let harness = harness();
    let group = group_for(PlanTier::Starter);
    harness.cloud.add_instance(
        &group,
        "i-W",
        labpool_common::cloud::InstanceState::Stopped,
        "10.0.2.2",
    );

    let view = harness
        .service
        .create_session(body_request("u8", PlanTier::Starter))
        .await
        .unwrap();
    assert_eq!(view.status, SessionStatus::Provisioning);
    assert_eq!(view.instance_id.as_deref(), Some("i-W"));
    assert_eq!(harness.cloud.started(), vec!["i-W".to_string()]);

    let record = stored_instance(&harness, "i-W").await;
    assert_eq!(record.status, InstanceStatus::Starting);

    // once the cloud reports it running and healthy, the status endpoint
    // finishes the job: gateway programmed, session ready
    harness
        .cloud
        .set_state("i-W", labpool_common::cloud::InstanceState::Running);
    let session_id = SessionId::from(view.session_id.as_str());
    let polled = harness.service.get_session(&session_id).await.unwrap();
    assert_eq!(polled.status, SessionStatus::Ready);
    let info = polled.connection_info.expect("connection info");
    assert!(info.connection_id.is_some());
    assert!(info.direct_url.is_some());
    let record = stored_instance(&harness, "i-W").await;
    assert_eq!(record.status, InstanceStatus::Assigned);
}

// Termination: gateway cleaned up, instance released, usage recorded, and
// the terminal write always lands.
#[tokio::test]
async fn delete_session_cleans_up_and_records_usage() {
    let harness = harness();
    seed_available_instance(&harness, "i-D", PlanTier::Pro, "10.0.0.11").await;
    let view = harness
        .service
        .create_session(body_request("u9", PlanTier::Pro))
        .await
        .unwrap();
    let session_id = SessionId::from(view.session_id.as_str());
    let info = view.connection_info.expect("connection info");
    let connection_id = info.connection_id.expect("gateway connection");
    let user = info.ephemeral_user.expect("ephemeral user");
    harness.gateway.set_active(&connection_id, now_ts());

    // make the session old enough to be billable
    let mut stored = stored_session(&harness, &session_id).await;
    stored.created_at -= 120;
    harness.store.put_obj(&stored).await.unwrap();

    let outcome = harness
        .service
        .delete_session(&session_id, TerminateBody::default())
        .await
        .unwrap();

    assert_eq!(outcome.status, SessionStatus::Terminated);
    assert_eq!(outcome.gateway_sessions_killed, 1);
    assert!(outcome.gateway_connection_deleted);
    assert!(outcome.gateway_user_deleted);
    assert!(outcome.instance_stopped);
    assert!(!harness.gateway.connection_exists(&connection_id));
    assert!(!harness.gateway.user_exists(&user));

    let record = stored_instance(&harness, "i-D").await;
    assert_eq!(record.status, InstanceStatus::Stopping);
    assert!(record.session_id.is_none());
    assert_eq!(harness.cloud.stopped(), vec!["i-D".to_string()]);

    let stats = harness
        .service
        .usage()
        .stats("u9", PlanTier::Pro, -1, now_ts())
        .await
        .unwrap();
    assert_eq!(stats.consumed_minutes, 2);
    assert_eq!(stats.session_count, 1);

    // terminating twice is idempotent
    let again = harness
        .service
        .delete_session(&session_id, TerminateBody::default())
        .await
        .unwrap();
    assert_eq!(again.status, SessionStatus::Terminated);
}

// Termination is monotone: once terminated a session never reads back live.
#[tokio::test]
async fn terminated_sessions_stay_terminated() {
    let harness = harness();
    let mut session = ready_session("u10", PlanTier::Pro, None);
    session.terminate(TerminationReason::UserRequested, now_ts());
    seed_session(&harness, &session).await;

    let view = harness.service.get_session(&session.session_id).await.unwrap();
    assert_eq!(view.status, SessionStatus::Terminated);

    let error = harness
        .service
        .heartbeat(&session.session_id, None, HeartbeatBody::default())
        .await
        .unwrap_err();
    assert!(matches!(error, SvcError::BadRequest { .. }));
}

// Heartbeats promote ready sessions to active and drive the idle warning
// hysteresis.
#[tokio::test]
async fn heartbeat_promotes_and_reports_idle_state() {
    let harness = harness();
    let mut session = ready_session("u11", PlanTier::Freemium, Some("c11"));
    session.instance_id = Some("i-H".to_string());
    seed_session(&harness, &session).await;

    let view = harness
        .service
        .heartbeat(&session.session_id, None, HeartbeatBody::default())
        .await
        .unwrap();
    assert_eq!(view.status, SessionStatus::Active);
    assert_eq!(view.idle_seconds, 0);
    assert!(!view.idle_warning);
    assert_eq!(view.idle_warning_threshold, 15 * 60);
    assert_eq!(view.idle_termination_threshold, 30 * 60);
    assert!(view.warning_message.is_none());

    // focus mode disables the countdown entirely
    let focused = harness
        .service
        .heartbeat(
            &session.session_id,
            None,
            HeartbeatBody {
                focus_mode: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!focused.idle_warning);
    assert!(focused.focus_mode);
    let stored = stored_session(&harness, &session.session_id).await;
    assert!(stored.focus_mode);
}

// An unknown session is a 404, not an internal error.
#[tokio::test]
async fn unknown_session_is_not_found() {
    let harness = harness();
    let missing = SessionId::from("sess-nope");
    assert!(matches!(
        harness.service.get_session(&missing).await.unwrap_err(),
        SvcError::SessionNotFound { .. }
    ));
    assert!(matches!(
        harness
            .service
            .delete_session(&missing, TerminateBody::default())
            .await
            .unwrap_err(),
        SvcError::SessionNotFound { .. }
    ));
}

// Authentication policy: with REQUIRE_AUTH the token is mandatory and must
// verify; replayed tokens are rejected.
#[tokio::test]
async fn auth_policy_rejects_missing_and_replayed_tokens() {
    let harness = harness_with(|config| {
        config.portal_secret = Some(PORTAL_SECRET.to_string());
        config.require_auth = true;
    });
    seed_available_instance(&harness, "i-T", PlanTier::Pro, "10.0.0.13").await;

    let missing = harness
        .service
        .create_session(CreateSessionRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(missing, SvcError::TokenRequired));

    let token = forge_token(portal_claims("u12", "pro", -1, "n-replay"));
    harness
        .service
        .create_session(CreateSessionRequest {
            token: Some(token.clone()),
            body: CreateSessionBody::default(),
        })
        .await
        .unwrap();
    // the same nonce again inside the window
    let replay = harness
        .service
        .create_session(CreateSessionRequest {
            token: Some(token),
            body: CreateSessionBody::default(),
        })
        .await
        .unwrap_err();
    assert!(matches!(replay, SvcError::Unauthenticated { .. }));
}

// Gateway token minting failure falls back to an admin-authenticated URL.
#[tokio::test]
async fn gateway_token_failure_falls_back_to_admin_url() {
    let harness = harness();
    seed_available_instance(&harness, "i-F", PlanTier::Pro, "10.0.0.15").await;
    harness.gateway.fail_user_auth(true);

    let view = harness
        .service
        .create_session(body_request("u13", PlanTier::Pro))
        .await
        .unwrap();
    assert_eq!(view.status, SessionStatus::Ready);
    let info = view.connection_info.expect("connection info");
    let direct_url = info.direct_url.expect("fallback url");
    assert!(direct_url.contains("?token=admin-token"));
}
