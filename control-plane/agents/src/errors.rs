//! Common error type used by the services. Variants map onto the wire error
//! taxonomy: client-visible contract errors keep their own variants, while
//! transient infrastructure failures surface as the port error they came
//! from.

use labpool_common::{
    auth::AuthError, cloud::CloudError, gateway::GatewayError, store::definitions::StoreError,
    types::plan::PlanTier,
};
use snafu::Snafu;

/// Error type for the session controller and reconciler.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum SvcError {
    /// The request carried no verifiable portal token.
    #[snafu(display("Request is not authenticated: {}", source))]
    Unauthenticated { source: AuthError },
    /// The request carried no token at all and the deployment requires one.
    #[snafu(display("Authentication required and no token provided"))]
    TokenRequired,
    #[snafu(display(
        "Monthly usage quota exhausted for plan '{}' ({}/{} minutes)",
        plan,
        consumed,
        quota
    ))]
    QuotaExceeded {
        plan: PlanTier,
        consumed: i64,
        quota: i64,
        resets_at: Option<String>,
    },
    #[snafu(display("Session '{}' was not found", id))]
    SessionNotFound { id: String },
    #[snafu(display("No workstation capacity left for plan '{}'", plan))]
    CapacityExhausted { plan: PlanTier },
    #[snafu(display("Invalid request: {}", reason))]
    BadRequest { reason: String },
    #[snafu(display("Store operation failed: {}", source))]
    StoreOp { source: StoreError },
    #[snafu(display("Cloud operation failed: {}", source))]
    CloudOp { source: CloudError },
    #[snafu(display("Gateway operation failed: {}", source))]
    GatewayOp { source: GatewayError },
    #[snafu(display("Internal error: {}", details))]
    Internal { details: String },
}

impl SvcError {
    /// Stable machine code surfaced to clients.
    pub fn machine_code(&self) -> &'static str {
        match self {
            Self::Unauthenticated { .. } | Self::TokenRequired => "unauthenticated",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::SessionNotFound { .. } => "not_found",
            Self::CapacityExhausted { .. } => "capacity",
            Self::BadRequest { .. } => "bad_request",
            Self::StoreOp { .. }
            | Self::CloudOp { .. }
            | Self::GatewayOp { .. }
            | Self::Internal { .. } => "internal",
        }
    }

    /// HTTP status the error maps to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthenticated { .. } | Self::TokenRequired => 401,
            Self::QuotaExceeded { .. } => 403,
            Self::SessionNotFound { .. } => 404,
            Self::CapacityExhausted { .. } => 503,
            Self::BadRequest { .. } => 400,
            Self::StoreOp { .. }
            | Self::CloudOp { .. }
            | Self::GatewayOp { .. }
            | Self::Internal { .. } => 500,
        }
    }
}

impl From<StoreError> for SvcError {
    fn from(source: StoreError) -> Self {
        Self::StoreOp { source }
    }
}
impl From<CloudError> for SvcError {
    fn from(source: CloudError) -> Self {
        Self::CloudOp { source }
    }
}
impl From<GatewayError> for SvcError {
    fn from(source: GatewayError) -> Self {
        Self::GatewayOp { source }
    }
}
