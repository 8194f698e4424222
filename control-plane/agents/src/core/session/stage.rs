//! Advisory stage/progress mapping for client loading animations. None of
//! this is a contract; clients must key behaviour off `status` alone.

use labpool_common::{
    cloud::InstanceState,
    types::session::{Session, SessionStatus},
};
use serde::Serialize;

#[derive(Serialize, Debug, Clone, Copy, Eq, PartialEq)]
#[derive(strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    SessionCreated,
    FindingInstance,
    InstanceClaimed,
    InstanceStarting,
    WaitingHealth,
    HealthCheckPassed,
    CreatingGatewayConnection,
    GeneratingToken,
    Ready,
    Error,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct StageInfo {
    pub stage: Stage,
    pub progress: u8,
    pub message: String,
    pub estimated_seconds: u32,
}

impl StageInfo {
    fn new(stage: Stage, progress: u8, message: &str, estimated_seconds: u32) -> Self {
        Self {
            stage,
            progress,
            message: message.to_string(),
            estimated_seconds,
        }
    }
}

/// Derive the stage from status, machine state, health counts and connection
/// readiness.
pub fn stage_info(session: &Session) -> StageInfo {
    match session.status {
        SessionStatus::Pending => {
            if session.instance_id.is_some() {
                StageInfo::new(
                    Stage::InstanceClaimed,
                    18,
                    "Workstation assigned, preparing to start",
                    45,
                )
            } else {
                StageInfo::new(Stage::FindingInstance, 10, "Finding a workstation", 55)
            }
        }
        SessionStatus::Provisioning => provisioning_stage(session),
        SessionStatus::Ready => StageInfo::new(Stage::Ready, 100, "Workstation ready", 0),
        SessionStatus::Active => StageInfo::new(Stage::Ready, 100, "Workstation active", 0),
        SessionStatus::Terminating | SessionStatus::Terminated => StageInfo::new(
            Stage::Terminated,
            0,
            "Session terminated",
            0,
        ),
        SessionStatus::Error => StageInfo::new(
            Stage::Error,
            0,
            session.error.as_deref().unwrap_or("An error occurred"),
            0,
        ),
    }
}

fn provisioning_stage(session: &Session) -> StageInfo {
    match session.instance_state {
        Some(InstanceState::Running) => {
            let health = session.health_checks.clone().unwrap_or_default();
            if !health.all_passed() {
                if health.passed_checks > 0 && health.passed_checks < health.total_checks {
                    StageInfo::new(
                        Stage::WaitingHealth,
                        (42 + health.passed_checks * 3).min(48) as u8,
                        &format!(
                            "Configuring network interfaces... ({}/{})",
                            health.passed_checks, health.total_checks
                        ),
                        15,
                    )
                } else {
                    StageInfo::new(Stage::WaitingHealth, 42, "Waiting for health checks", 25)
                }
            } else {
                match &session.connection_info {
                    None => StageInfo::new(
                        Stage::HealthCheckPassed,
                        50,
                        "Preparing the workstation",
                        20,
                    ),
                    Some(info) if info.connection_id.is_none() => StageInfo::new(
                        Stage::CreatingGatewayConnection,
                        62,
                        "Creating the remote-desktop connection",
                        15,
                    ),
                    Some(_) => StageInfo::new(
                        Stage::GeneratingToken,
                        94,
                        "Generating access credentials",
                        3,
                    ),
                }
            }
        }
        _ => StageInfo::new(Stage::InstanceStarting, 25, "Workstation is starting up", 40),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labpool_common::{cloud::HealthChecks, types::plan::PlanTier};

    fn session(status: SessionStatus) -> Session {
        let mut session = Session::new_pending("u1", "U One", PlanTier::Pro, 3600, 0);
        session.status = status;
        session
    }

    #[test]
    fn progress_is_monotone_along_the_happy_path() {
        let pending = stage_info(&session(SessionStatus::Pending));

        let mut claimed = session(SessionStatus::Pending);
        claimed.instance_id = Some("i-1".into());
        let claimed = stage_info(&claimed);

        let mut starting = session(SessionStatus::Provisioning);
        starting.instance_state = Some(InstanceState::Pending);
        let starting = stage_info(&starting);

        let mut waiting = session(SessionStatus::Provisioning);
        waiting.instance_state = Some(InstanceState::Running);
        waiting.health_checks = Some(HealthChecks::initializing());
        let waiting = stage_info(&waiting);

        let ready = stage_info(&session(SessionStatus::Ready));

        let stages = [pending, claimed, starting, waiting, ready];
        for pair in stages.windows(2) {
            assert!(pair[0].progress < pair[1].progress, "{:?}", pair);
        }
        assert_eq!(stages.last().unwrap().progress, 100);
    }
}
