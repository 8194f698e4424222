//! The session lifecycle controller: authenticate, enforce quota, reap stale
//! sessions, claim a workstation, program the gateway and hand back a
//! single-click URL.

use super::{
    allocation::{self, Allocation, ClaimedInstance},
    ActivityKind, CreateSessionRequest, HeartbeatBody, HeartbeatView, OwnerSessions, SessionView,
    TerminateBody, TerminateView,
};
use crate::{
    core::{
        notify::{Notifier, PushTransport, TracingPush},
        registry::Registry,
        usage::UsageLedger,
    },
    errors::SvcError,
};
use labpool_common::{
    auth::TokenVerifier,
    gateway::{CreateConnection, GatewayOperations},
    now_ts,
    store::definitions::Store,
    types::{
        instance::InstanceStatus,
        plan::PlanTier,
        session::{
            ConnectionInfo, Session, SessionId, SessionKey, SessionStatus, TerminationReason,
        },
    },
};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, sync::Arc, time::Duration};

/// A session stuck provisioning without an instance for longer than this is
/// declared failed.
const PROVISIONING_TIMEOUT_SECS: i64 = 180;
/// A running instance is promoted even without passing health checks after
/// this long.
const HEALTH_TIMEOUT_SECS: i64 = 300;
/// Pause between gateway user creation and the first token attempt.
const GATEWAY_PROPAGATION_DELAY: Duration = Duration::from_secs(1);
const TOKEN_AUTH_RETRIES: u32 = 3;

/// The trusted identity a request resolved to.
#[derive(Debug, Clone)]
struct Identity {
    owner_id: String,
    display_name: String,
    plan: PlanTier,
    quota_minutes: i64,
    metadata: HashMap<String, serde_json::Value>,
}

/// What to do about an owner's existing in-flight session.
enum ExistingDisposition {
    /// The session is live (or still provisioning); hand it back.
    Reuse(Session),
    /// The session was stale and has been reaped; allocation may proceed.
    Reaped,
}

pub struct SessionService<S: Store> {
    registry: Registry<S>,
    usage: UsageLedger<S>,
    notifier: Notifier<S>,
    verifier: Option<TokenVerifier>,
}

impl<S: Store> SessionService<S> {
    pub fn new(registry: Registry<S>) -> Self {
        Self::with_transport(registry, Arc::new(TracingPush))
    }

    pub fn with_transport(registry: Registry<S>, transport: Arc<dyn PushTransport>) -> Self {
        let verifier = registry
            .config()
            .portal_secret
            .as_deref()
            .map(TokenVerifier::new);
        let usage = UsageLedger::new(registry.store().clone());
        let notifier = Notifier::new(registry.store().clone(), transport);
        Self {
            registry,
            usage,
            notifier,
            verifier,
        }
    }

    pub fn usage(&self) -> &UsageLedger<S> {
        &self.usage
    }

    /// Resolve the request identity from a verified token if the deployment
    /// requires one, from the body otherwise.
    pub fn resolve_identity_claims(
        &self,
        token: Option<&str>,
    ) -> Result<Option<labpool_common::auth::PortalClaims>, SvcError> {
        let config = self.registry.config();
        match (token, &self.verifier) {
            (Some(token), Some(verifier)) => match verifier.verify(token) {
                Ok(claims) => Ok(Some(claims)),
                Err(source) => {
                    if config.require_auth {
                        Err(SvcError::Unauthenticated { source })
                    } else {
                        tracing::warn!(%source, "Ignoring unverifiable token");
                        Ok(None)
                    }
                }
            },
            (Some(_), None) => {
                if config.require_auth {
                    Err(SvcError::TokenRequired)
                } else {
                    tracing::warn!("Token provided but no portal secret is configured");
                    Ok(None)
                }
            }
            (None, _) => {
                if config.require_auth {
                    Err(SvcError::TokenRequired)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn resolve_identity(&self, request: &CreateSessionRequest) -> Result<Identity, SvcError> {
        let mut metadata = request.body.metadata.clone();
        match self.resolve_identity_claims(request.token.as_deref())? {
            Some(claims) => {
                metadata.insert("auth_method".to_string(), "portal_token".into());
                if let Some(site) = &claims.site_url {
                    metadata.insert("portal_site".to_string(), site.clone().into());
                }
                if let Some(email) = &claims.email {
                    metadata.insert("owner_email".to_string(), email.clone().into());
                }
                Ok(Identity {
                    owner_id: claims.user_id.clone(),
                    display_name: claims.display_name(),
                    plan: claims.plan,
                    quota_minutes: claims.effective_quota_minutes(),
                    metadata,
                })
            }
            None => {
                let owner_id = request.body.owner_id.clone().ok_or(SvcError::BadRequest {
                    reason: "missing required field 'owner_id'".to_string(),
                })?;
                metadata.insert("auth_method".to_string(), "request_body".into());
                let plan = request.body.plan.unwrap_or_default();
                Ok(Identity {
                    owner_id,
                    display_name: request
                        .body
                        .display_name
                        .clone()
                        .unwrap_or_else(|| "Unknown".to_string()),
                    plan,
                    quota_minutes: plan.default_quota_minutes(),
                    metadata,
                })
            }
        }
    }

    /// Create (or reuse) a session for the requesting owner.
    #[tracing::instrument(skip(self, request), fields(request.service = true))]
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<SessionView, SvcError> {
        let now = now_ts();
        let identity = self.resolve_identity(&request)?;
        tracing::info!(
            owner.id = %identity.owner_id,
            plan = %identity.plan,
            quota = identity.quota_minutes,
            "Session requested"
        );

        // quota gate
        if identity.quota_minutes != -1 {
            let check = self
                .usage
                .check_quota_at(&identity.owner_id, identity.quota_minutes, now)
                .await?;
            if !check.allowed {
                return Err(SvcError::QuotaExceeded {
                    plan: identity.plan,
                    consumed: check.consumed_minutes,
                    quota: identity.quota_minutes,
                    resets_at: check.resets_at,
                });
            }
        }

        // one session per owner: reuse it while the user is connected, reap
        // it when the gateway shows them gone
        let in_flight =
            allocation::in_flight_sessions_for_owner(self.registry.store(), &identity.owner_id)
                .await?;
        if in_flight.len() >= self.registry.config().max_sessions {
            let existing = in_flight.into_iter().next().ok_or(SvcError::Internal {
                details: "in-flight session disappeared".to_string(),
            })?;
            match self.probe_existing(existing, now).await? {
                ExistingDisposition::Reuse(session) => {
                    return Ok(SessionView::from_session(&session, now).reused());
                }
                ExistingDisposition::Reaped => {}
            }
        }

        let mut session = Session::new_pending(
            &identity.owner_id,
            &identity.display_name,
            identity.plan,
            self.registry.config().session_ttl.as_secs() as i64,
            now,
        );
        session.metadata = identity.metadata;
        self.registry.store().put_obj(&session).await?;

        // the pool first, the scaling group second
        if let Some(claimed) = allocation::claim_pooled(&self.registry, &session, now).await? {
            return self.finalize_ready(session, claimed, now).await;
        }
        match allocation::cold_start(&self.registry, &session, true, now).await? {
            Allocation::Claimed(claimed) => self.finalize_ready(session, claimed, now).await,
            Allocation::Starting { instance_id } => {
                session.status = SessionStatus::Provisioning;
                session.instance_id = Some(instance_id);
                session.updated_at = now;
                self.registry.store().put_obj(&session).await?;
                self.notifier.session_changed(&session).await;
                Ok(SessionView::from_session(&session, now))
            }
            Allocation::ScaledUp => {
                session.status = SessionStatus::Provisioning;
                session.updated_at = now;
                self.registry.store().put_obj(&session).await?;
                self.notifier.session_changed(&session).await;
                Ok(SessionView::from_session(&session, now))
            }
            Allocation::AtCapacity => {
                session.status = SessionStatus::Error;
                session.error = Some("capacity".to_string());
                session.updated_at = now;
                self.registry.store().put_obj(&session).await?;
                Err(SvcError::CapacityExhausted {
                    plan: identity.plan,
                })
            }
        }
    }

    /// Decide whether an existing in-flight session is live or stale.
    async fn probe_existing(
        &self,
        existing: Session,
        now: i64,
    ) -> Result<ExistingDisposition, SvcError> {
        let connection_id = match existing.gateway_connection_id() {
            Some(id) => id.to_string(),
            None => {
                // no gateway connection yet: still provisioning is fine
                if matches!(
                    existing.status,
                    SessionStatus::Pending | SessionStatus::Provisioning
                ) {
                    return Ok(ExistingDisposition::Reuse(existing));
                }
                return self.maybe_reap(existing, false, now).await;
            }
        };

        // liveness probe against the gateway, short timeout; on error assume
        // disconnected so a wedged gateway cannot lock the user out
        let connected = match self.registry.gateway_probe().active_connections().await {
            Ok(active) => active
                .get(&connection_id)
                .map(|sessions| !sessions.is_empty())
                .unwrap_or(false),
            Err(error) => {
                tracing::warn!(%error, "Gateway liveness probe failed, assuming disconnected");
                false
            }
        };
        self.maybe_reap(existing, connected, now).await
    }

    async fn maybe_reap(
        &self,
        existing: Session,
        connected: bool,
        now: i64,
    ) -> Result<ExistingDisposition, SvcError> {
        if connected {
            tracing::info!(
                session.id = %existing.session_id,
                "Owner is still connected, reusing the session"
            );
            return Ok(ExistingDisposition::Reuse(existing));
        }
        let grace = self.registry.config().grace_period.as_secs() as i64;
        if existing.last_seen() + grace >= now {
            // disconnected but within grace: treat as live
            return Ok(ExistingDisposition::Reuse(existing));
        }
        tracing::info!(
            session.id = %existing.session_id,
            "Owner logged out of the gateway, reaping the stale session"
        );
        self.reap_stale(existing, now).await?;
        Ok(ExistingDisposition::Reaped)
    }

    /// Terminate a session whose user is no longer connected, returning its
    /// instance to the pool.
    async fn reap_stale(&self, mut session: Session, now: i64) -> Result<(), SvcError> {
        session.terminate(TerminationReason::StaleGatewayLogout, now);
        self.registry.store().put_obj(&session).await?;

        if let Some(instance_id) = session.instance_id.clone() {
            allocation::release_instance(
                self.registry.store(),
                &instance_id,
                InstanceStatus::Available,
                now,
            )
            .await?;
            allocation::clear_claim_tags(self.registry.cloud().as_ref(), &instance_id, None).await;
        }

        self.cleanup_gateway(&session).await;
        self.notifier.session_changed(&session).await;
        Ok(())
    }

    /// Delete the gateway connection and ephemeral user of a session.
    /// Best-effort with the short-timeout handle.
    async fn cleanup_gateway(&self, session: &Session) -> (usize, bool, bool) {
        let gateway = self.registry.gateway_probe();
        let mut killed = 0;
        let mut connection_deleted = false;
        let mut user_deleted = false;
        if let Some(connection_id) = session.gateway_connection_id() {
            match gateway.kill_sessions(connection_id).await {
                Ok(count) => killed = count,
                Err(error) => {
                    tracing::warn!(%error, "Failed to kill gateway sessions")
                }
            }
            match gateway.delete_connection(connection_id).await {
                Ok(()) => connection_deleted = true,
                Err(error) => {
                    tracing::warn!(%error, "Failed to delete gateway connection")
                }
            }
        }
        if session.gateway_connection_id().is_none() {
            // gateway programming may have died between creating the
            // connection and persisting its id; sweep by workstation address
            if let Some(ip) = &session.instance_ip {
                if let Ok(orphans) = gateway.find_connections_by_host(ip).await {
                    for connection_id in orphans {
                        if gateway.delete_connection(&connection_id).await.is_ok() {
                            connection_deleted = true;
                        }
                    }
                }
            }
        }
        if let Some(user) = session.ephemeral_user() {
            match gateway.delete_user(user).await {
                Ok(()) => user_deleted = true,
                Err(error) => tracing::warn!(%error, "Failed to delete gateway user"),
            }
        }
        (killed, connection_deleted, user_deleted)
    }

    /// Program the gateway and commit the session as ready.
    async fn finalize_ready(
        &self,
        mut session: Session,
        claimed: ClaimedInstance,
        now: i64,
    ) -> Result<SessionView, SvcError> {
        session.instance_id = Some(claimed.instance_id.clone());
        match claimed.instance_ip {
            Some(ip) => {
                session.instance_ip = Some(ip.clone());
                let info = self.program_gateway(&session, &ip).await;
                session.connection_info = Some(info);
                session.status = SessionStatus::Ready;
            }
            None => {
                // claimed but not yet addressable: the status endpoint will
                // finish the job once the cloud reports an address
                session.status = SessionStatus::Provisioning;
            }
        }
        session.updated_at = now;
        self.registry.store().put_obj(&session).await?;
        self.notifier.session_changed(&session).await;
        Ok(SessionView::from_session(&session, now))
    }

    /// Create the connection record and the single-session user, mint the
    /// user token and build the viewer URL. Falls back to an
    /// admin-authenticated URL when the ephemeral-user path fails.
    async fn program_gateway(&self, session: &Session, instance_ip: &str) -> ConnectionInfo {
        let config = self.registry.config();
        let gateway = self.registry.gateway();
        let mut info = ConnectionInfo::new(&config.gateway_public_url, instance_ip);

        let request = CreateConnection {
            name: format!(
                "Workstation - {} ({})",
                session.owner_display_name,
                session.session_id.tail()
            ),
            hostname: instance_ip.to_string(),
            port: info.ports.rdp,
            username: config.rdp_username.clone(),
            password: config.rdp_password.clone(),
            security: "any".to_string(),
            ignore_cert: true,
        };
        let connection_id = match gateway.create_connection(&request).await {
            Ok(id) => id,
            Err(error) => {
                tracing::warn!(
                    session.id = %session.session_id,
                    %error,
                    "Failed to create gateway connection"
                );
                return info;
            }
        };
        info.connection_id = Some(connection_id.clone());

        match self
            .ephemeral_user_token(gateway.as_ref(), session, &connection_id)
            .await
        {
            Ok((user, token)) => {
                info.ephemeral_user = Some(user);
                info.direct_url = Some(gateway.viewer_url(&connection_id, &token));
            }
            Err(error) => {
                tracing::warn!(
                    session.id = %session.session_id,
                    %error,
                    "Ephemeral user setup failed, falling back to admin token"
                );
                match gateway.auth().await {
                    Ok(admin_token) => {
                        info.direct_url = Some(gateway.viewer_url(&connection_id, &admin_token));
                    }
                    Err(error) => {
                        tracing::warn!(%error, "Admin fallback failed, URL will require login");
                    }
                }
            }
        }
        info
    }

    /// Create the per-session gateway account and authenticate as it.
    async fn ephemeral_user_token(
        &self,
        gateway: &dyn GatewayOperations,
        session: &Session,
        connection_id: &str,
    ) -> Result<(String, String), SvcError> {
        let config = self.registry.config();
        let user = format!("session_{}", session.session_id.tail());
        let password = ephemeral_password(
            session.session_id.as_str(),
            &session.owner_id,
            &config.ephemeral_salt,
        );

        gateway.create_user(&user, &password).await?;
        gateway.grant_read(&user, connection_id).await?;
        // the gateway needs a moment to propagate the new user and its
        // permission before a token can be minted against them
        tokio::time::sleep(GATEWAY_PROPAGATION_DELAY).await;

        let mut last_error = None;
        for attempt in 1 ..= TOKEN_AUTH_RETRIES {
            match gateway.auth_as_user(&user, &password).await {
                Ok(token) => return Ok((user, token)),
                Err(error) => {
                    tracing::debug!(attempt, %error, "Token mint attempt failed");
                    last_error = Some(error);
                    if attempt < TOKEN_AUTH_RETRIES {
                        tokio::time::sleep(GATEWAY_PROPAGATION_DELAY).await;
                    }
                }
            }
        }
        Err(last_error
            .map(|source| SvcError::GatewayOp { source })
            .unwrap_or(SvcError::Internal {
                details: "token mint failed".to_string(),
            }))
    }

    /// Current state of a session, enriched with cloud ground truth. For a
    /// provisioning session this may finish the allocation itself: scale-up
    /// completing between requests is recovered here.
    #[tracing::instrument(skip(self), fields(request.service = true))]
    pub async fn get_session(&self, session_id: &SessionId) -> Result<SessionView, SvcError> {
        let mut session: Session = self
            .registry
            .store()
            .find_obj(&SessionKey::from(session_id))
            .await?
            .ok_or_else(|| SvcError::SessionNotFound {
                id: session_id.to_string(),
            })?;
        let observed = session.clone();
        let now = now_ts();

        self.enrich(&mut session, now).await?;

        if session != observed {
            session.updated_at = now;
            allocation::persist_if_not_terminated(self.registry.store(), &observed, &session)
                .await?;
            if session.status != observed.status {
                self.notifier.session_changed(&session).await;
            }
        }
        Ok(SessionView::from_session(&session, now))
    }

    async fn enrich(&self, session: &mut Session, now: i64) -> Result<(), SvcError> {
        if session.status.terminal() || session.status == SessionStatus::Terminating {
            return Ok(());
        }
        if session.expires_at <= now {
            // the reconciler releases the instance; here we only stop lying
            // to the client about a live session
            session.terminate(TerminationReason::Expired, now);
            return Ok(());
        }

        let instance_id = match session.instance_id.clone() {
            Some(id) => id,
            None => {
                if session.status != SessionStatus::Provisioning {
                    return Ok(());
                }
                // recovery path: a scale-up may have completed since the
                // create call, so re-run the claim
                if let Some(claimed) =
                    allocation::claim_pooled(&self.registry, session, now).await?
                {
                    return self.attach_claimed(session, claimed).await;
                }
                match allocation::cold_start(&self.registry, session, false, now).await? {
                    Allocation::Claimed(claimed) => {
                        return self.attach_claimed(session, claimed).await;
                    }
                    Allocation::Starting { instance_id } => {
                        session.instance_id = Some(instance_id);
                        return Ok(());
                    }
                    _ => {}
                }
                if now - session.created_at > PROVISIONING_TIMEOUT_SECS {
                    session.status = SessionStatus::Error;
                    session.error = Some(
                        "Failed to allocate a workstation. Please try again.".to_string(),
                    );
                }
                return Ok(());
            }
        };

        let description = match self.registry.cloud().describe(&instance_id).await {
            Ok(description) => description,
            Err(error) => {
                tracing::warn!(instance.id = %instance_id, %error, "Instance lookup failed");
                session.status = SessionStatus::Error;
                session.error = Some("Workstation not found".to_string());
                return Ok(());
            }
        };

        session.instance_state = Some(description.state);
        use labpool_common::cloud::InstanceState::*;
        match description.state {
            Running => {
                session.instance_ip = description.private_ip.clone();
                session.health_checks = Some(description.health.clone());
                let healthy = description.health.all_passed()
                    || now - session.created_at > HEALTH_TIMEOUT_SECS;
                if healthy {
                    if session.status == SessionStatus::Provisioning
                        || session.status == SessionStatus::Pending
                    {
                        session.status = SessionStatus::Ready;
                        allocation::ensure_assigned(
                            self.registry.store(),
                            &instance_id,
                            session,
                            now,
                        )
                        .await?;
                    }
                    // first time healthy: program the gateway and persist the
                    // connection info
                    if session.gateway_connection_id().is_none() {
                        if let Some(ip) = session.instance_ip.clone() {
                            let info = self.program_gateway(session, &ip).await;
                            session.connection_info = Some(info);
                        }
                    }
                } else if !matches!(
                    session.status,
                    SessionStatus::Ready | SessionStatus::Active
                ) {
                    session.status = SessionStatus::Provisioning;
                }
            }
            Pending => session.status = SessionStatus::Provisioning,
            Stopping | ShuttingDown => session.status = SessionStatus::Terminating,
            Stopped | Terminated => session.status = SessionStatus::Terminated,
            Unknown => {}
        }
        Ok(())
    }

    async fn attach_claimed(
        &self,
        session: &mut Session,
        claimed: ClaimedInstance,
    ) -> Result<(), SvcError> {
        session.instance_id = Some(claimed.instance_id.clone());
        if let Some(ip) = claimed.instance_ip {
            session.instance_ip = Some(ip.clone());
            let info = self.program_gateway(session, &ip).await;
            session.connection_info = Some(info);
            session.status = SessionStatus::Ready;
        }
        Ok(())
    }

    /// Terminate a session. Cleanup steps are best-effort; the final status
    /// write happens regardless.
    #[tracing::instrument(skip(self, request), fields(request.service = true))]
    pub async fn delete_session(
        &self,
        session_id: &SessionId,
        request: TerminateBody,
    ) -> Result<TerminateView, SvcError> {
        let mut session: Session = self
            .registry
            .store()
            .find_obj(&SessionKey::from(session_id))
            .await?
            .ok_or_else(|| SvcError::SessionNotFound {
                id: session_id.to_string(),
            })?;

        let now = now_ts();
        if matches!(
            session.status,
            SessionStatus::Terminated | SessionStatus::Terminating
        ) {
            return Ok(TerminateView {
                session_id: session.session_id.to_string(),
                status: session.status,
                instance_id: session.instance_id.clone(),
                instance_stopped: false,
                gateway_sessions_killed: 0,
                gateway_connection_deleted: false,
                gateway_user_deleted: false,
                reason: session.termination_reason.unwrap_or_default(),
                terminated_at: session.terminated_at.unwrap_or(now),
            });
        }

        session.status = SessionStatus::Terminating;
        session.termination_reason = Some(request.reason);
        session.terminated_at = Some(now);
        session.updated_at = now;
        self.registry.store().put_obj(&session).await?;

        let (killed, connection_deleted, user_deleted) =
            if self.registry.config().enable_gateway_cleanup {
                self.cleanup_gateway(&session).await
            } else {
                tracing::info!("Gateway cleanup disabled by configuration");
                (0, false, false)
            };

        let instance_id = session.instance_id.clone();
        if let Some(instance_id) = &instance_id {
            let to_status = if request.stop_instance {
                InstanceStatus::Stopping
            } else {
                InstanceStatus::Available
            };
            if let Err(error) = allocation::release_instance(
                self.registry.store(),
                instance_id,
                to_status,
                now,
            )
            .await
            {
                tracing::warn!(%error, "Failed to release instance record");
            }
            allocation::clear_claim_tags(self.registry.cloud().as_ref(), instance_id, None).await;
        }

        // usage is recorded before any stop request so billing never depends
        // on how fast the machine winds down
        if let Err(error) = self
            .usage
            .record_session(
                &session.owner_id,
                session.created_at,
                now,
                session.plan,
                session.plan.default_quota_minutes(),
            )
            .await
        {
            tracing::warn!(%error, "Failed to record session usage");
        }

        let mut instance_stopped = false;
        if request.stop_instance {
            if let Some(instance_id) = &instance_id {
                match self.registry.cloud().stop(instance_id).await {
                    Ok(()) => instance_stopped = true,
                    Err(error) => {
                        tracing::warn!(instance.id = %instance_id, %error, "Failed to stop instance")
                    }
                }
            }
        }

        // this write must land even when everything above went sideways
        session.terminate(request.reason, now_ts());
        self.registry.store().put_obj(&session).await?;
        self.notifier.session_changed(&session).await;

        Ok(TerminateView {
            session_id: session.session_id.to_string(),
            status: session.status,
            instance_id,
            instance_stopped,
            gateway_sessions_killed: killed,
            gateway_connection_deleted: connection_deleted,
            gateway_user_deleted: user_deleted,
            reason: request.reason,
            terminated_at: now,
        })
    }

    /// Record a client heartbeat and report the idle countdown.
    pub async fn heartbeat(
        &self,
        session_id: &SessionId,
        token: Option<&str>,
        body: HeartbeatBody,
    ) -> Result<HeartbeatView, SvcError> {
        let _ = self.resolve_identity_claims(token)?;
        let mut session: Session = self
            .registry
            .store()
            .find_obj(&SessionKey::from(session_id))
            .await?
            .ok_or_else(|| SvcError::SessionNotFound {
                id: session_id.to_string(),
            })?;
        if !matches!(
            session.status,
            SessionStatus::Ready | SessionStatus::Active | SessionStatus::Provisioning
        ) {
            return Err(SvcError::BadRequest {
                reason: format!("session is {}, heartbeat not applicable", session.status),
            });
        }
        let observed = session.clone();
        let now = now_ts();

        // fold in the gateway's view of the connection
        let (connected, active_count, gateway_last_activity) = match session
            .gateway_connection_id()
        {
            None => (false, 0, 0),
            Some(connection_id) => {
                match self.registry.gateway_probe().active_connections().await {
                    Ok(active) => match active.get(connection_id) {
                        Some(sessions) => (
                            !sessions.is_empty(),
                            sessions.len(),
                            sessions
                                .iter()
                                .filter_map(|s| s.start_time)
                                .max()
                                .unwrap_or(0),
                        ),
                        None => (false, 0, 0),
                    },
                    Err(error) => {
                        tracing::warn!(%error, "Gateway activity probe failed");
                        (false, 0, 0)
                    }
                }
            }
        };

        let mut effective_last_active = session.last_seen().max(gateway_last_activity);
        let active_signal =
            (body.activity_type == ActivityKind::Browser && body.tab_visible) || connected;
        if active_signal {
            effective_last_active = now;
        }
        let idle_seconds = (now - effective_last_active).max(0);

        let (warning, termination) = self.registry.config().idle_thresholds(session.plan);
        let (warning_threshold, termination_threshold) = if body.focus_mode {
            (i64::MAX, i64::MAX)
        } else {
            (warning.as_secs() as i64, termination.as_secs() as i64)
        };
        let idle_warning = idle_seconds >= warning_threshold && idle_seconds < termination_threshold;
        let idle_critical = idle_seconds >= termination_threshold;

        session.focus_mode = body.focus_mode;
        session.last_active_at = Some(effective_last_active);
        session.last_heartbeat_at = Some(now);
        session.updated_at = now;
        if idle_warning && session.idle_warning_sent_at.is_none() {
            session.idle_warning_sent_at = Some(now);
        } else if !idle_warning && !idle_critical && session.idle_warning_sent_at.is_some() {
            // activity resumed: clear the warning so it can fire again
            session.idle_warning_sent_at = None;
        }
        if session.status == SessionStatus::Ready && active_signal {
            session.status = SessionStatus::Active;
        }
        allocation::persist_if_not_terminated(self.registry.store(), &observed, &session).await?;

        let time_until_warning = (warning_threshold.saturating_sub(idle_seconds)).max(0);
        let time_until_termination = (termination_threshold.saturating_sub(idle_seconds)).max(0);
        let (warning_message, warning_level) = if idle_critical {
            (
                Some("Session will be terminated due to inactivity".to_string()),
                Some("critical".to_string()),
            )
        } else if idle_warning {
            (
                Some(format!(
                    "Session idle - will terminate in {} minutes",
                    time_until_termination / 60
                )),
                Some("warning".to_string()),
            )
        } else {
            (None, None)
        };

        Ok(HeartbeatView {
            session_id: session.session_id.to_string(),
            status: session.status,
            idle_seconds,
            idle_warning,
            idle_critical,
            idle_warning_threshold: warning_threshold,
            idle_termination_threshold: termination_threshold,
            time_until_warning,
            time_until_termination,
            gateway_connected: connected,
            gateway_active_connections: active_count,
            expires_at: session.expires_at,
            focus_mode: session.focus_mode,
            plan: session.plan,
            warning_message,
            warning_level,
        })
    }

    /// All sessions of an owner, newest first, split into active and
    /// historical.
    pub async fn sessions_for_owner(&self, owner_id: &str) -> Result<OwnerSessions, SvcError> {
        let now = now_ts();
        let sessions = allocation::sessions_for_owner(self.registry.store(), owner_id).await?;
        let views: Vec<SessionView> = sessions
            .iter()
            .map(|session| SessionView::from_session(session, now))
            .collect();
        let active_sessions = views
            .iter()
            .filter(|view| {
                matches!(
                    view.status,
                    SessionStatus::Pending
                        | SessionStatus::Provisioning
                        | SessionStatus::Ready
                        | SessionStatus::Active
                )
            })
            .cloned()
            .collect();
        Ok(OwnerSessions {
            owner_id: owner_id.to_string(),
            active_sessions,
            total_sessions: views.len(),
            sessions: views.into_iter().take(10).collect(),
        })
    }
}

/// Deterministic password for the single-session gateway account:
/// SHA-256 over `session_id:owner_id:salt`, truncated to 16 hex characters.
/// Idempotent re-creation on retry without extra state; the secret that
/// matters is the minted token.
pub fn ephemeral_password(session_id: &str, owner_id: &str, salt: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}:{}", session_id, owner_id, salt).as_bytes());
    hex::encode(digest)[.. 16].to_string()
}
