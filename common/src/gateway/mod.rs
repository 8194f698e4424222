//! Abstraction over the display gateway: connection records, ephemeral users,
//! access tokens and the active-connection feed used for liveness inference.

pub mod client;

use async_trait::async_trait;
use snafu::Snafu;
use std::collections::HashMap;

/// Error type returned by the gateway port.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum GatewayError {
    /// The HTTP request itself failed (connect, timeout, TLS).
    #[snafu(display("Gateway request {} '{}' failed: {}", method, endpoint, source))]
    Request {
        method: String,
        endpoint: String,
        source: reqwest::Error,
    },
    /// The gateway rejected the admin or user credentials.
    #[snafu(display("Gateway authentication failed for user '{}'", username))]
    AuthFailed { username: String },
    /// The gateway answered with something we cannot use.
    #[snafu(display("Unexpected gateway payload: {}", reason))]
    UnexpectedPayload { reason: String },
}

/// Parameters of a new remote-desktop connection record.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateConnection {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Gateway security mode, e.g. "any", "nla", "tls".
    pub security: String,
    pub ignore_cert: bool,
}

/// One live gateway session on a connection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActiveConnection {
    /// Opaque per-session key, used to kill the session.
    pub key: String,
    pub username: Option<String>,
    /// Unix seconds at which the session started.
    pub start_time: Option<i64>,
    pub remote_host: Option<String>,
}

/// Operations the control plane requires from the display gateway. All of
/// them may fail; callers tolerate partial cleanup.
#[async_trait]
pub trait GatewayOperations: Send + Sync {
    /// Acquire a short-lived admin token.
    async fn auth(&self) -> Result<String, GatewayError>;

    /// Create a connection record, returning its identifier.
    async fn create_connection(&self, request: &CreateConnection) -> Result<String, GatewayError>;

    /// Delete a connection record.
    async fn delete_connection(&self, connection_id: &str) -> Result<(), GatewayError>;

    /// Force-disconnect every live session on a connection, returning how
    /// many were killed.
    async fn kill_sessions(&self, connection_id: &str) -> Result<usize, GatewayError>;

    /// Identifiers of all connection records pointing at the given host.
    async fn find_connections_by_host(&self, host: &str) -> Result<Vec<String>, GatewayError>;

    /// Create a user, or update its password if it already exists.
    async fn create_user(&self, name: &str, password: &str) -> Result<(), GatewayError>;

    /// Delete a user.
    async fn delete_user(&self, name: &str) -> Result<(), GatewayError>;

    /// Grant the user read access to a connection.
    async fn grant_read(&self, user: &str, connection_id: &str) -> Result<(), GatewayError>;

    /// Authenticate as the given user and return their personal token.
    async fn auth_as_user(&self, name: &str, password: &str) -> Result<String, GatewayError>;

    /// All live sessions, grouped by connection identifier.
    async fn active_connections(
        &self,
    ) -> Result<HashMap<String, Vec<ActiveConnection>>, GatewayError>;

    /// Tokenized viewer URL for the given connection, on the public base.
    fn viewer_url(&self, connection_id: &str, token: &str) -> String;

    /// Public base URL handed to users.
    fn public_base(&self) -> String;
}

/// The gateway client identifier: standard base64 of
/// `connection_id NUL 'c' NUL data_source`.
pub fn encode_client_id(connection_id: &str, data_source: &str) -> String {
    base64::encode(format!("{}\u{0}c\u{0}{}", connection_id, data_source))
}

/// Tokenized viewer URL. The token is a query parameter and must precede the
/// fragment, otherwise the browser never sends it to the gateway.
pub fn tokenized_viewer_url(
    base: &str,
    token: &str,
    connection_id: &str,
    data_source: &str,
) -> String {
    format!(
        "{}/?token={}#/client/{}",
        base.trim_end_matches('/'),
        token,
        encode_client_id(connection_id, data_source)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_is_nul_separated_base64() {
        // base64("3\0c\0postgresql")
        assert_eq!(
            encode_client_id("3", "postgresql"),
            base64::encode(b"3\x00c\x00postgresql")
        );
    }

    #[test]
    fn viewer_url_places_token_before_fragment() {
        let url = tokenized_viewer_url("https://gw.example.com/guacamole/", "T0K", "7", "mysql");
        let expected_id = base64::encode(b"7\x00c\x00mysql");
        assert_eq!(
            url,
            format!("https://gw.example.com/guacamole/?token=T0K#/client/{}", expected_id)
        );
        let query = url.find("?token=").unwrap();
        let fragment = url.find('#').unwrap();
        assert!(query < fragment);
    }
}
