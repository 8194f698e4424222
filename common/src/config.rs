//! Environment-driven configuration of the orchestrator. Every knob has a
//! default so a local deployment starts with nothing but the gateway address
//! set.

use crate::types::plan::PlanTier;
use snafu::Snafu;
use std::{collections::HashMap, env, str::FromStr, time::Duration};
use strum::IntoEnumIterator;

/// Error type returned when the environment cannot be interpreted.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Environment variable '{}' has invalid value '{}'", name, value))]
    InvalidValue { name: String, value: String },
}

/// Per-tier settings: which scaling group feeds the pool and how aggressive
/// the idle sweep is.
#[derive(Debug, Clone)]
pub struct TierConfig {
    pub plan: PlanTier,
    /// Name of the scaling group backing this tier, empty if the tier is not
    /// deployed.
    pub group_name: String,
    pub idle_warning: Duration,
    pub idle_termination: Duration,
}

/// Static configuration handed to the allocator and the reconciler.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Gateway base URL used for API calls (may be a private address).
    pub gateway_api_url: String,
    /// Gateway base URL embedded in user-facing links.
    pub gateway_public_url: String,
    pub gateway_admin_user: String,
    pub gateway_admin_pass: String,
    /// Shared secret for portal token verification; absent disables
    /// verification (test deployments only).
    pub portal_secret: Option<String>,
    /// Reject requests without a verifiable token.
    pub require_auth: bool,
    /// Credentials programmed into every connection record.
    pub rdp_username: String,
    pub rdp_password: String,
    /// Salt mixed into the derived ephemeral-user password.
    pub ephemeral_salt: String,
    pub session_ttl: Duration,
    /// Concurrent in-flight sessions allowed per owner.
    pub max_sessions: usize,
    /// How long a disconnected session is given before it may be reaped.
    pub grace_period: Duration,
    pub enable_idle_detection: bool,
    pub enable_gateway_cleanup: bool,
    tiers: HashMap<PlanTier, TierConfig>,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value,
        }),
    }
}

fn bool_var(name: &str, default: bool) -> bool {
    match env::var(name) {
        Err(_) => default,
        Ok(value) => value.eq_ignore_ascii_case("true") || value == "1",
    }
}

impl OrchestratorConfig {
    /// Resolve the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut tiers = HashMap::new();
        for plan in PlanTier::iter() {
            let upper = plan.to_string().to_uppercase();
            let warning_secs = parse_var(
                &format!("IDLE_WARNING_{}", upper),
                plan.default_idle_warning().as_secs(),
            )?;
            let termination_secs = parse_var(
                &format!("IDLE_TERMINATION_{}", upper),
                plan.default_idle_termination().as_secs(),
            )?;
            tiers.insert(
                plan,
                TierConfig {
                    plan,
                    group_name: var_or(&format!("SCALING_GROUP_{}", upper), ""),
                    idle_warning: Duration::from_secs(warning_secs),
                    idle_termination: Duration::from_secs(termination_secs),
                },
            );
        }

        let ttl_hours: u64 = parse_var("SESSION_TTL_HOURS", 4)?;
        let grace_secs: u64 = parse_var("SESSION_GRACE_SECONDS", 120)?;
        Ok(Self {
            gateway_api_url: var_or("GATEWAY_API_URL", "https://localhost/guacamole"),
            gateway_public_url: var_or("GATEWAY_PUBLIC_URL", "https://localhost/guacamole"),
            gateway_admin_user: var_or("GATEWAY_ADMIN_USER", "guacadmin"),
            gateway_admin_pass: var_or("GATEWAY_ADMIN_PASS", "guacadmin"),
            portal_secret: env::var("PORTAL_WEBHOOK_SECRET").ok().filter(|s| !s.is_empty()),
            require_auth: bool_var("REQUIRE_AUTH", false),
            rdp_username: var_or("RDP_USERNAME", "kali"),
            rdp_password: var_or("RDP_PASSWORD", "kali"),
            ephemeral_salt: var_or("EPHEMERAL_CRED_SALT", "secret"),
            session_ttl: Duration::from_secs(ttl_hours * 3600),
            max_sessions: parse_var("MAX_SESSIONS", 1)?,
            grace_period: Duration::from_secs(grace_secs),
            enable_idle_detection: bool_var("ENABLE_IDLE_DETECTION", true),
            enable_gateway_cleanup: bool_var("ENABLE_GATEWAY_CLEANUP", true),
            tiers,
        })
    }

    /// Configuration for tests and local tools, bypassing the environment.
    pub fn for_tests(tiers: Vec<TierConfig>) -> Self {
        Self {
            gateway_api_url: "https://gw.example.com/guacamole".to_string(),
            gateway_public_url: "https://gw.example.com/guacamole".to_string(),
            gateway_admin_user: "guacadmin".to_string(),
            gateway_admin_pass: "guacadmin".to_string(),
            portal_secret: None,
            require_auth: false,
            rdp_username: "kali".to_string(),
            rdp_password: "kali".to_string(),
            ephemeral_salt: "secret".to_string(),
            session_ttl: Duration::from_secs(4 * 3600),
            max_sessions: 1,
            grace_period: Duration::from_secs(120),
            enable_idle_detection: true,
            enable_gateway_cleanup: true,
            tiers: tiers.into_iter().map(|tier| (tier.plan, tier)).collect(),
        }
    }

    /// The tier settings for the given plan.
    pub fn tier(&self, plan: PlanTier) -> Option<&TierConfig> {
        self.tiers.get(&plan)
    }

    /// The scaling group feeding the given plan, falling back to any
    /// configured tier when this one is not deployed.
    pub fn group_for(&self, plan: PlanTier) -> Option<String> {
        match self.tier(plan) {
            Some(tier) if !tier.group_name.is_empty() => Some(tier.group_name.clone()),
            _ => {
                let fallback = PlanTier::iter()
                    .filter_map(|p| self.tier(p))
                    .find(|tier| !tier.group_name.is_empty())
                    .map(|tier| tier.group_name.clone());
                if let Some(group) = &fallback {
                    tracing::warn!(
                        plan = %plan,
                        group = %group,
                        "Plan has no scaling group configured, falling back"
                    );
                }
                fallback
            }
        }
    }

    /// Tiers which have a scaling group configured.
    pub fn deployed_tiers(&self) -> Vec<&TierConfig> {
        let mut tiers: Vec<&TierConfig> = self
            .tiers
            .values()
            .filter(|tier| !tier.group_name.is_empty())
            .collect();
        tiers.sort_by_key(|tier| tier.plan.to_string());
        tiers
    }

    /// Idle thresholds for the given plan (warning, termination).
    pub fn idle_thresholds(&self, plan: PlanTier) -> (Duration, Duration) {
        match self.tier(plan) {
            Some(tier) => (tier.idle_warning, tier.idle_termination),
            None => (
                plan.default_idle_warning(),
                plan.default_idle_termination(),
            ),
        }
    }
}

impl TierConfig {
    pub fn new(plan: PlanTier, group_name: &str) -> Self {
        Self {
            plan,
            group_name: group_name.to_string(),
            idle_warning: plan.default_idle_warning(),
            idle_termination: plan.default_idle_termination(),
        }
    }
}
