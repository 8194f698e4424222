//! The synchronous session request path: message types, the allocator and
//! the controller itself.

pub mod allocation;
pub mod service;
pub mod stage;

use labpool_common::{
    types::plan::PlanTier,
    types::session::{ConnectionInfo, Session, SessionStatus, TerminationReason},
};
use serde::{Deserialize, Serialize};
use stage::StageInfo;
use std::collections::HashMap;

/// Body of a session creation request. When a verified portal token is
/// present its claims win over these fields; otherwise they are only
/// honoured in deployments that do not require authentication.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct CreateSessionBody {
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub plan: Option<PlanTier>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A session creation request as received from the transport layer.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionRequest {
    /// Raw bearer token, if one was sent.
    pub token: Option<String>,
    pub body: CreateSessionBody,
}

/// Body of a termination request.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TerminateBody {
    #[serde(default)]
    pub reason: TerminationReason,
    /// Whether to stop the workstation rather than return it warm.
    #[serde(default = "default_true")]
    pub stop_instance: bool,
}

impl Default for TerminateBody {
    fn default() -> Self {
        Self {
            reason: TerminationReason::default(),
            stop_instance: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// What produced a heartbeat.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Browser,
    Gateway,
}

impl Default for ActivityKind {
    fn default() -> Self {
        Self::Browser
    }
}

/// Body of a heartbeat request.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct HeartbeatBody {
    #[serde(default)]
    pub activity_type: ActivityKind,
    #[serde(default = "default_true")]
    pub tab_visible: bool,
    #[serde(default)]
    pub focus_mode: bool,
}

impl Default for HeartbeatBody {
    fn default() -> Self {
        Self {
            activity_type: ActivityKind::Browser,
            tab_visible: true,
            focus_mode: false,
        }
    }
}

/// Session representation returned to clients.
#[derive(Serialize, Debug, Clone)]
pub struct SessionView {
    pub session_id: String,
    pub owner_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_info: Option<ConnectionInfo>,
    /// Single-click URL, duplicated out of `connection_info` for convenience.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: i64,
    /// Seconds until expiry.
    pub time_remaining: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reused: Option<bool>,
    // advisory progress reporting, for UI animations only
    pub stage: stage::Stage,
    pub progress: u8,
    pub stage_message: String,
    pub estimated_seconds: u32,
}

impl SessionView {
    pub fn from_session(session: &Session, now: i64) -> Self {
        let StageInfo {
            stage,
            progress,
            message,
            estimated_seconds,
        } = stage::stage_info(session);
        Self {
            session_id: session.session_id.to_string(),
            owner_id: session.owner_id.clone(),
            status: session.status,
            instance_id: session.instance_id.clone(),
            instance_ip: session.instance_ip.clone(),
            connection_info: session.connection_info.clone(),
            direct_url: session
                .connection_info
                .as_ref()
                .and_then(|info| info.direct_url.clone()),
            created_at: session.created_at,
            updated_at: session.updated_at,
            expires_at: session.expires_at,
            time_remaining: (session.expires_at - now).max(0),
            error: session.error.clone(),
            termination_reason: session.termination_reason,
            reused: None,
            stage,
            progress,
            stage_message: message,
            estimated_seconds,
        }
    }

    pub fn reused(mut self) -> Self {
        self.reused = Some(true);
        self
    }
}

/// All sessions of one owner, newest first.
#[derive(Serialize, Debug, Clone)]
pub struct OwnerSessions {
    pub owner_id: String,
    pub active_sessions: Vec<SessionView>,
    pub total_sessions: usize,
    /// The most recent sessions, active or not.
    pub sessions: Vec<SessionView>,
}

/// Outcome of a termination request.
#[derive(Serialize, Debug, Clone)]
pub struct TerminateView {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub instance_stopped: bool,
    pub gateway_sessions_killed: usize,
    pub gateway_connection_deleted: bool,
    pub gateway_user_deleted: bool,
    pub reason: TerminationReason,
    pub terminated_at: i64,
}

/// Idle bookkeeping returned for a heartbeat.
#[derive(Serialize, Debug, Clone)]
pub struct HeartbeatView {
    pub session_id: String,
    pub status: SessionStatus,
    pub idle_seconds: i64,
    pub idle_warning: bool,
    pub idle_critical: bool,
    pub idle_warning_threshold: i64,
    pub idle_termination_threshold: i64,
    pub time_until_warning: i64,
    pub time_until_termination: i64,
    pub gateway_connected: bool,
    pub gateway_active_connections: usize,
    pub expires_at: i64,
    pub focus_mode: bool,
    pub plan: PlanTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_level: Option<String>,
}
