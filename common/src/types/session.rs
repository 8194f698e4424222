//! Definition of the session entity, the primary record of the control plane.

use crate::{
    cloud::{HealthChecks, InstanceState},
    store::definitions::{ObjectKey, StorableObject, StorableObjectType},
    types::plan::PlanTier,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque session identifier, `sess-` followed by 12 hex characters.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Hash, Default)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        let uuid = uuid::Uuid::new_v4().to_simple().to_string();
        Self(format!("sess-{}", &uuid[.. 12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last 8 characters, used to derive gateway resource names.
    pub fn tail(&self) -> &str {
        let len = self.0.len();
        &self.0[len.saturating_sub(8) ..]
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
#[derive(strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SessionStatus {
    /// Created, no workstation yet.
    Pending,
    /// A workstation is assigned but not yet usable.
    Provisioning,
    /// Workstation running, gateway programmed.
    Ready,
    /// Heartbeat or gateway activity observed.
    Active,
    /// Cleanup in progress.
    Terminating,
    Terminated,
    /// Sink state reachable from any other.
    Error,
}

impl SessionStatus {
    /// The states which count against `MAX_SESSIONS` and are eligible for
    /// expiry and idle sweeps.
    pub fn in_flight(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Provisioning | Self::Ready | Self::Active
        )
    }

    /// Terminal states are never revived.
    pub fn terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }
}

/// Why a session was terminated.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
#[derive(strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TerminationReason {
    UserRequested,
    Admin,
    Expired,
    IdleTimeout,
    /// The user was no longer connected to the gateway when a new session
    /// request arrived.
    StaleGatewayLogout,
}

impl Default for TerminationReason {
    fn default() -> Self {
        Self::UserRequested
    }
}

/// Well-known protocol ports of a workstation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnectionPorts {
    pub rdp: u16,
    pub vnc: u16,
    pub ssh: u16,
}

impl Default for ConnectionPorts {
    fn default() -> Self {
        Self {
            rdp: 3389,
            vnc: 5901,
            ssh: 22,
        }
    }
}

/// Connection details handed to the user once the gateway is programmed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    /// Remote-desktop protocol spoken behind the gateway.
    #[serde(rename = "type")]
    pub kind: String,
    /// Public base URL of the display gateway.
    pub gateway_url: String,
    /// Gateway connection identifier, absent if programming failed.
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Single-session gateway account, absent if programming failed.
    #[serde(default)]
    pub ephemeral_user: Option<String>,
    pub instance_ip: String,
    #[serde(default)]
    pub ports: ConnectionPorts,
    /// Tokenized single-click viewer URL.
    #[serde(default)]
    pub direct_url: Option<String>,
}

impl ConnectionInfo {
    pub fn new(gateway_url: &str, instance_ip: &str) -> Self {
        Self {
            kind: "rdp".to_string(),
            gateway_url: gateway_url.to_string(),
            connection_id: None,
            ephemeral_user: None,
            instance_ip: instance_ip.to_string(),
            ports: ConnectionPorts::default(),
            direct_url: None,
        }
    }
}

/// Session data structure used by the persistent store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: SessionId,
    pub owner_id: String,
    pub owner_display_name: String,
    pub plan: PlanTier,
    pub status: SessionStatus,
    pub created_at: i64,
    pub updated_at: i64,
    /// Absolute expiry; reached, the reconciler terminates the session.
    pub expires_at: i64,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub instance_ip: Option<String>,
    #[serde(default)]
    pub instance_state: Option<InstanceState>,
    /// Reachability checks as of the last status poll.
    #[serde(default)]
    pub health_checks: Option<HealthChecks>,
    #[serde(default)]
    pub connection_info: Option<ConnectionInfo>,
    #[serde(default)]
    pub last_active_at: Option<i64>,
    #[serde(default)]
    pub last_heartbeat_at: Option<i64>,
    #[serde(default)]
    pub idle_warning_sent_at: Option<i64>,
    /// Disables idle termination while set.
    #[serde(default)]
    pub focus_mode: bool,
    #[serde(default)]
    pub termination_reason: Option<TerminationReason>,
    #[serde(default)]
    pub terminated_at: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    /// Opaque caller-provided side channel.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Session {
    /// A new pending session for the given owner.
    pub fn new_pending(
        owner_id: &str,
        display_name: &str,
        plan: PlanTier,
        ttl_secs: i64,
        now: i64,
    ) -> Self {
        Self {
            session_id: SessionId::new(),
            owner_id: owner_id.to_string(),
            owner_display_name: display_name.to_string(),
            plan,
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl_secs,
            instance_id: None,
            instance_ip: None,
            instance_state: None,
            health_checks: None,
            connection_info: None,
            last_active_at: None,
            last_heartbeat_at: None,
            idle_warning_sent_at: None,
            focus_mode: false,
            termination_reason: None,
            terminated_at: None,
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// Gateway connection identifier, when programmed.
    pub fn gateway_connection_id(&self) -> Option<&str> {
        self.connection_info
            .as_ref()
            .and_then(|info| info.connection_id.as_deref())
    }

    /// Gateway account created for this session, when programmed.
    pub fn ephemeral_user(&self) -> Option<&str> {
        self.connection_info
            .as_ref()
            .and_then(|info| info.ephemeral_user.as_deref())
    }

    /// Most recent client-side activity signal.
    pub fn last_seen(&self) -> i64 {
        self.last_active_at
            .unwrap_or(self.created_at)
            .max(self.last_heartbeat_at.unwrap_or(0))
    }

    /// Marks the session terminated. Terminal states are never left again.
    pub fn terminate(&mut self, reason: TerminationReason, now: i64) {
        self.status = SessionStatus::Terminated;
        self.termination_reason = Some(reason);
        self.terminated_at = Some(now);
        self.updated_at = now;
    }
}

/// Key used by the store to uniquely identify a session.
pub struct SessionKey(SessionId);

impl From<&SessionId> for SessionKey {
    fn from(id: &SessionId) -> Self {
        Self(id.clone())
    }
}

impl ObjectKey for SessionKey {
    fn key_type(&self) -> StorableObjectType {
        StorableObjectType::Session
    }

    fn key_uuid(&self) -> String {
        self.0.as_str().to_string()
    }
}

impl StorableObject for Session {
    type Key = SessionKey;

    fn key(&self) -> Self::Key {
        SessionKey(self.session_id.clone())
    }
}
