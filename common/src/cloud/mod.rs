//! Abstraction over the workstation cloud: machine state, health, start/stop,
//! tags, and scaling-group capacity. The concrete provider SDK sits behind
//! the [`CloudControl`] trait; [`mock::MockCloud`] backs tests and local
//! deployments.

pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::HashMap;

/// Error type returned by the cloud-control port.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum CloudError {
    /// The instance does not exist (any more).
    #[snafu(display("Instance '{}' was not found", instance_id))]
    InstanceNotFound { instance_id: String },
    /// The scaling group does not exist.
    #[snafu(display("Scaling group '{}' was not found", group))]
    GroupNotFound { group: String },
    /// The requested capacity is outside the group bounds.
    #[snafu(display(
        "Desired capacity {} outside the [{}, {}] bounds of group '{}'",
        desired,
        min,
        max,
        group
    ))]
    CapacityBounds {
        group: String,
        desired: u32,
        min: u32,
        max: u32,
    },
    /// The provider rejected or failed the request.
    #[snafu(display("Cloud operation '{}' failed: {}", operation, reason))]
    Request { operation: String, reason: String },
}

/// Machine state as reported by the cloud.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
#[derive(strum_macros::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    ShuttingDown,
    Stopped,
    Terminated,
    Unknown,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl InstanceState {
    pub fn running(&self) -> bool {
        matches!(self, Self::Running)
    }
    pub fn stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// Reachability checks of an instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct HealthChecks {
    pub system_status: String,
    pub instance_status: String,
    pub passed_checks: u32,
    pub total_checks: u32,
}

const HEALTHY_STATUSES: [&str; 3] = ["ok", "insufficient-data", "not-applicable"];

impl HealthChecks {
    /// All checks passed iff both sub-statuses are acceptable OR every
    /// individual check passed. "initializing" is not yet healthy.
    pub fn all_passed(&self) -> bool {
        let system_ok = HEALTHY_STATUSES.contains(&self.system_status.as_str());
        let instance_ok = HEALTHY_STATUSES.contains(&self.instance_status.as_str());
        (system_ok && instance_ok)
            || (self.total_checks > 0 && self.passed_checks == self.total_checks)
    }

    /// Checks for an instance which has not started reporting yet.
    pub fn initializing() -> Self {
        Self {
            system_status: "initializing".to_string(),
            instance_status: "initializing".to_string(),
            passed_checks: 0,
            total_checks: 0,
        }
    }

    /// Fully passing checks.
    pub fn passing() -> Self {
        Self {
            system_status: "ok".to_string(),
            instance_status: "ok".to_string(),
            passed_checks: 3,
            total_checks: 3,
        }
    }
}

/// Description of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub state: InstanceState,
    pub private_ip: Option<String>,
    pub health: HealthChecks,
}

/// Membership state of an instance within its scaling group.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LifecycleState {
    InService,
    /// Stopped member of the warm pool.
    WarmedStopped,
    Pending,
    Terminating,
    Unknown,
}

impl LifecycleState {
    /// Members which may be claimed or started.
    pub fn claimable(&self) -> bool {
        matches!(self, Self::InService | Self::WarmedStopped)
    }
}

/// One scaling-group member.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupMember {
    pub instance_id: String,
    pub lifecycle_state: LifecycleState,
}

/// Capacity settings of a scaling group.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct GroupCapacity {
    pub min: u32,
    pub max: u32,
    pub desired: u32,
}

/// Operations the control plane requires from the workstation cloud.
#[async_trait]
pub trait CloudControl: Send + Sync {
    /// Describe one instance: state, addressing and health.
    async fn describe(&self, instance_id: &str) -> Result<InstanceDescription, CloudError>;

    /// Start a stopped instance. Success means the request was accepted.
    async fn start(&self, instance_id: &str) -> Result<(), CloudError>;

    /// Stop a running instance. Success means the request was accepted.
    async fn stop(&self, instance_id: &str) -> Result<(), CloudError>;

    /// Best-effort metadata update; callers never let a failure here block
    /// termination.
    async fn tag(
        &self,
        instance_id: &str,
        tags: &HashMap<String, String>,
    ) -> Result<(), CloudError>;

    /// Enumerate the members of a scaling group.
    async fn group_members(&self, group: &str) -> Result<Vec<GroupMember>, CloudError>;

    /// Capacity settings of a scaling group.
    async fn group_capacity(&self, group: &str) -> Result<GroupCapacity, CloudError>;

    /// Adjust the desired capacity, `min <= desired <= max`.
    async fn set_desired(&self, group: &str, desired: u32) -> Result<(), CloudError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_accepts_ok_and_insufficient_data() {
        let health = HealthChecks {
            system_status: "ok".into(),
            instance_status: "insufficient-data".into(),
            passed_checks: 0,
            total_checks: 0,
        };
        assert!(health.all_passed());
    }

    #[test]
    fn health_accepts_all_individual_checks_passing() {
        let health = HealthChecks {
            system_status: "impaired".into(),
            instance_status: "unknown".into(),
            passed_checks: 3,
            total_checks: 3,
        };
        assert!(health.all_passed());
    }

    #[test]
    fn initializing_is_not_healthy() {
        assert!(!HealthChecks::initializing().all_passed());
        let health = HealthChecks {
            system_status: "ok".into(),
            instance_status: "initializing".into(),
            passed_checks: 1,
            total_checks: 3,
        };
        assert!(!health.all_passed());
    }

    #[test]
    fn instance_state_uses_cloud_spelling() {
        assert_eq!(
            serde_json::to_string(&InstanceState::ShuttingDown).unwrap(),
            "\"shutting-down\""
        );
    }
}
