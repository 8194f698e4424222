//! HTTP client for the display gateway REST API.

use super::{
    ActiveConnection, CreateConnection, GatewayError, GatewayOperations, Request,
    UnexpectedPayload,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use snafu::{OptionExt, ResultExt};
use std::{collections::HashMap, time::Duration};

const DEFAULT_DATA_SOURCE: &str = "postgresql";

/// Response of `POST /api/tokens`.
#[derive(Deserialize, Debug)]
struct TokenResponse {
    #[serde(rename = "authToken")]
    auth_token: String,
    #[serde(rename = "dataSource", default)]
    data_source: Option<String>,
}

/// One entry of the active-connection feed.
#[derive(Deserialize, Debug)]
struct ActiveConnectionEntry {
    #[serde(rename = "connectionIdentifier", default)]
    connection_identifier: Option<String>,
    #[serde(default)]
    username: Option<String>,
    /// Milliseconds since the epoch.
    #[serde(rename = "startDate", default)]
    start_date: Option<i64>,
    #[serde(rename = "remoteHost", default)]
    remote_host: Option<String>,
}

/// Client for the display gateway. API calls go to the internal base URL;
/// URLs handed to users are built on the public base URL.
pub struct GatewayClient {
    api_base: String,
    public_base: String,
    username: String,
    password: String,
    http: reqwest::Client,
    token: Mutex<Option<String>>,
    data_source: Mutex<String>,
}

impl GatewayClient {
    /// A new client with the given per-call timeout. The gateway often sits
    /// behind a self-signed certificate, so verification is disabled.
    pub fn new(
        api_base: &str,
        public_base: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .context(Request {
                method: "BUILD",
                endpoint: api_base.to_string(),
            })?;
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            public_base: public_base.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            http,
            token: Mutex::new(None),
            data_source: Mutex::new(DEFAULT_DATA_SOURCE.to_string()),
        })
    }

    fn data_source(&self) -> String {
        self.data_source.lock().clone()
    }

    async fn token(&self) -> Result<String, GatewayError> {
        if let Some(token) = self.token.lock().clone() {
            return Ok(token);
        }
        self.auth().await
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<TokenResponse, GatewayError> {
        let endpoint = format!("{}/api/tokens", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .form(&[("username", username), ("password", password)])
            .send()
            .await
            .context(Request {
                method: "POST",
                endpoint: endpoint.clone(),
            })?;
        if !response.status().is_success() {
            return Err(GatewayError::AuthFailed {
                username: username.to_string(),
            });
        }
        response.json::<TokenResponse>().await.context(Request {
            method: "POST",
            endpoint,
        })
    }

    /// Issue a JSON request against the data-source API, with the admin token
    /// appended as a query parameter.
    async fn request(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response, GatewayError> {
        let token = self.token().await?;
        let url = format!(
            "{}/api/session/data/{}{}{}token={}",
            self.api_base,
            self.data_source(),
            endpoint,
            if endpoint.contains('?') { "&" } else { "?" },
            token
        );
        let mut request = self.http.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.context(Request {
            method: method.to_string(),
            endpoint: endpoint.to_string(),
        })?;
        // an expired admin token means re-authentication, not failure
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            *self.token.lock() = None;
        }
        Ok(response)
    }

    async fn request_ok(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response, GatewayError> {
        let response = self.request(method.clone(), endpoint, body).await?;
        response.error_for_status().context(Request {
            method: method.to_string(),
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl GatewayOperations for GatewayClient {
    async fn auth(&self) -> Result<String, GatewayError> {
        let response = self.authenticate(&self.username, &self.password).await?;
        if let Some(data_source) = response.data_source {
            *self.data_source.lock() = data_source;
        }
        *self.token.lock() = Some(response.auth_token.clone());
        tracing::debug!(data_source = %self.data_source(), "Gateway admin authentication succeeded");
        Ok(response.auth_token)
    }

    async fn create_connection(&self, request: &CreateConnection) -> Result<String, GatewayError> {
        let body = json!({
            "parentIdentifier": "ROOT",
            "name": request.name,
            "protocol": "rdp",
            "parameters": {
                "hostname": request.hostname,
                "port": request.port.to_string(),
                "username": request.username,
                "password": request.password,
                "security": request.security,
                "ignore-cert": if request.ignore_cert { "true" } else { "false" },
                "resize-method": "display-update",
                "enable-wallpaper": "false",
                "enable-theming": "false",
                "enable-font-smoothing": "true",
                "color-depth": "24",
            },
            "attributes": {
                "max-connections": "1",
                "max-connections-per-user": "1",
            },
        });
        let response = self
            .request_ok(reqwest::Method::POST, "/connections", Some(body))
            .await?;
        let created: Value = response.json().await.context(Request {
            method: "POST",
            endpoint: "/connections",
        })?;
        let identifier = created
            .get("identifier")
            .and_then(Value::as_str)
            .context(UnexpectedPayload {
                reason: "connection response carries no identifier",
            })?;
        Ok(identifier.to_string())
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<(), GatewayError> {
        self.request_ok(
            reqwest::Method::DELETE,
            &format!("/connections/{}", connection_id),
            None,
        )
        .await?;
        Ok(())
    }

    async fn kill_sessions(&self, connection_id: &str) -> Result<usize, GatewayError> {
        let active = self.active_connections().await?;
        let mut killed = 0;
        for session in active.get(connection_id).into_iter().flatten() {
            let result = self
                .request_ok(
                    reqwest::Method::DELETE,
                    &format!("/activeConnections/{}", session.key),
                    None,
                )
                .await;
            match result {
                Ok(_) => killed += 1,
                Err(error) => tracing::warn!(
                    connection.id = connection_id,
                    %error,
                    "Failed to kill one gateway session"
                ),
            }
        }
        Ok(killed)
    }

    async fn find_connections_by_host(&self, host: &str) -> Result<Vec<String>, GatewayError> {
        let response = self
            .request_ok(reqwest::Method::GET, "/connections", None)
            .await?;
        let connections: HashMap<String, Value> = response.json().await.context(Request {
            method: "GET",
            endpoint: "/connections",
        })?;
        Ok(connections
            .into_iter()
            .filter(|(_, data)| {
                data.get("parameters")
                    .and_then(|params| params.get("hostname"))
                    .and_then(Value::as_str)
                    == Some(host)
            })
            .map(|(id, _)| id)
            .collect())
    }

    async fn create_user(&self, name: &str, password: &str) -> Result<(), GatewayError> {
        let body = json!({
            "username": name,
            "password": password,
            "attributes": {},
        });
        let created = self
            .request_ok(reqwest::Method::POST, "/users", Some(body))
            .await;
        if created.is_ok() {
            return Ok(());
        }
        // the user may already exist from an earlier retry; update the
        // password instead
        self.request_ok(
            reqwest::Method::PUT,
            &format!("/users/{}", name),
            Some(json!({ "password": password })),
        )
        .await?;
        Ok(())
    }

    async fn delete_user(&self, name: &str) -> Result<(), GatewayError> {
        self.request_ok(reqwest::Method::DELETE, &format!("/users/{}", name), None)
            .await?;
        Ok(())
    }

    async fn grant_read(&self, user: &str, connection_id: &str) -> Result<(), GatewayError> {
        let body = json!([{
            "op": "add",
            "path": format!("/connectionPermissions/{}", connection_id),
            "value": "READ",
        }]);
        self.request_ok(
            reqwest::Method::PATCH,
            &format!("/users/{}/permissions", user),
            Some(body),
        )
        .await?;
        Ok(())
    }

    async fn auth_as_user(&self, name: &str, password: &str) -> Result<String, GatewayError> {
        let response = self.authenticate(name, password).await?;
        Ok(response.auth_token)
    }

    async fn active_connections(
        &self,
    ) -> Result<HashMap<String, Vec<ActiveConnection>>, GatewayError> {
        let response = self
            .request_ok(reqwest::Method::GET, "/activeConnections", None)
            .await?;
        let entries: HashMap<String, ActiveConnectionEntry> =
            response.json().await.context(Request {
                method: "GET",
                endpoint: "/activeConnections",
            })?;
        let mut grouped: HashMap<String, Vec<ActiveConnection>> = HashMap::new();
        for (key, entry) in entries {
            let connection_id = match entry.connection_identifier {
                Some(id) => id,
                None => continue,
            };
            grouped.entry(connection_id).or_default().push(ActiveConnection {
                key,
                username: entry.username,
                start_time: entry.start_date.map(|ms| ms / 1000),
                remote_host: entry.remote_host,
            });
        }
        Ok(grouped)
    }

    fn viewer_url(&self, connection_id: &str, token: &str) -> String {
        super::tokenized_viewer_url(&self.public_base, token, connection_id, &self.data_source())
    }

    fn public_base(&self) -> String {
        self.public_base.clone()
    }
}
