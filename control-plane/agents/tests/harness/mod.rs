//! Shared fixtures for the scenario tests: an in-memory store, the mock
//! cloud, a scripted gateway double and a fully wired session service.

#![allow(dead_code)]

use hmac::{Hmac, Mac};
use labpool_agents::core::{registry::Registry, session::service::SessionService};
use labpool_common::{
    cloud::{mock::MockCloud, InstanceState},
    config::{OrchestratorConfig, TierConfig},
    gateway::{
        tokenized_viewer_url, ActiveConnection, CreateConnection, GatewayError, GatewayOperations,
    },
    now_ts,
    store::{definitions::Store, memory::InMemoryStore},
    types::{
        instance::{InstanceRecord, InstanceRecordKey, InstanceStatus},
        plan::PlanTier,
        session::{ConnectionInfo, Session, SessionKey, SessionStatus},
    },
};
use parking_lot::Mutex;
use sha2::Sha256;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

pub const DATA_SOURCE: &str = "postgresql";
pub const PUBLIC_BASE: &str = "https://gw.example.com/guacamole";
pub const PORTAL_SECRET: &str = "portal-shared-secret";

#[derive(Default)]
struct GatewayState {
    next_id: u32,
    connections: HashMap<String, CreateConnection>,
    users: HashMap<String, String>,
    permissions: HashMap<String, HashSet<String>>,
    active: HashMap<String, Vec<ActiveConnection>>,
    fail_user_auth: bool,
}

/// Scripted display-gateway double.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a user is connected to the given connection.
    pub fn set_active(&self, connection_id: &str, started_at: i64) {
        self.state
            .lock()
            .active
            .entry(connection_id.to_string())
            .or_default()
            .push(ActiveConnection {
                key: format!("key-{}", connection_id),
                username: Some("someone".to_string()),
                start_time: Some(started_at),
                remote_host: Some("203.0.113.9".to_string()),
            });
    }

    pub fn clear_active(&self, connection_id: &str) {
        self.state.lock().active.remove(connection_id);
    }

    pub fn fail_user_auth(&self, fail: bool) {
        self.state.lock().fail_user_auth = fail;
    }

    pub fn connection_exists(&self, connection_id: &str) -> bool {
        self.state.lock().connections.contains_key(connection_id)
    }

    pub fn user_exists(&self, name: &str) -> bool {
        self.state.lock().users.contains_key(name)
    }
}

#[async_trait::async_trait]
impl GatewayOperations for FakeGateway {
    async fn auth(&self) -> Result<String, GatewayError> {
        Ok("admin-token".to_string())
    }

    async fn create_connection(&self, request: &CreateConnection) -> Result<String, GatewayError> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id.to_string();
        state.connections.insert(id.clone(), request.clone());
        Ok(id)
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<(), GatewayError> {
        self.state.lock().connections.remove(connection_id);
        Ok(())
    }

    async fn kill_sessions(&self, connection_id: &str) -> Result<usize, GatewayError> {
        Ok(self
            .state
            .lock()
            .active
            .remove(connection_id)
            .map(|sessions| sessions.len())
            .unwrap_or(0))
    }

    async fn find_connections_by_host(&self, host: &str) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .state
            .lock()
            .connections
            .iter()
            .filter(|(_, request)| request.hostname == host)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn create_user(&self, name: &str, password: &str) -> Result<(), GatewayError> {
        self.state
            .lock()
            .users
            .insert(name.to_string(), password.to_string());
        Ok(())
    }

    async fn delete_user(&self, name: &str) -> Result<(), GatewayError> {
        self.state.lock().users.remove(name);
        Ok(())
    }

    async fn grant_read(&self, user: &str, connection_id: &str) -> Result<(), GatewayError> {
        self.state
            .lock()
            .permissions
            .entry(user.to_string())
            .or_default()
            .insert(connection_id.to_string());
        Ok(())
    }

    async fn auth_as_user(&self, name: &str, password: &str) -> Result<String, GatewayError> {
        let state = self.state.lock();
        if state.fail_user_auth || state.users.get(name).map(String::as_str) != Some(password) {
            return Err(GatewayError::AuthFailed {
                username: name.to_string(),
            });
        }
        Ok(format!("tok-{}", name))
    }

    async fn active_connections(
        &self,
    ) -> Result<HashMap<String, Vec<ActiveConnection>>, GatewayError> {
        Ok(self.state.lock().active.clone())
    }

    fn viewer_url(&self, connection_id: &str, token: &str) -> String {
        tokenized_viewer_url(PUBLIC_BASE, token, connection_id, DATA_SOURCE)
    }

    fn public_base(&self) -> String {
        PUBLIC_BASE.to_string()
    }
}

pub struct Harness {
    pub store: InMemoryStore,
    pub cloud: Arc<MockCloud>,
    pub gateway: Arc<FakeGateway>,
    pub registry: Registry<InMemoryStore>,
    pub service: SessionService<InMemoryStore>,
}

pub fn group_for(plan: PlanTier) -> String {
    format!("asg-{}", plan)
}

/// A fully wired harness with all three tiers deployed (groups min=0 max=2
/// desired=0) and body-based identity.
pub fn harness() -> Harness {
    harness_with(|_| {})
}

/// Same, with a hook to tweak the configuration before wiring.
pub fn harness_with(tweak: impl FnOnce(&mut OrchestratorConfig)) -> Harness {
    let tiers = vec![
        TierConfig::new(PlanTier::Freemium, &group_for(PlanTier::Freemium)),
        TierConfig::new(PlanTier::Starter, &group_for(PlanTier::Starter)),
        TierConfig::new(PlanTier::Pro, &group_for(PlanTier::Pro)),
    ];
    let mut config = OrchestratorConfig::for_tests(tiers);
    tweak(&mut config);

    let store = InMemoryStore::new();
    let cloud = Arc::new(
        MockCloud::new()
            .with_group(&group_for(PlanTier::Freemium), 0, 2, 0)
            .with_group(&group_for(PlanTier::Starter), 0, 2, 0)
            .with_group(&group_for(PlanTier::Pro), 0, 2, 0),
    );
    let gateway = Arc::new(FakeGateway::new());

    let registry = Registry::new(
        store.clone(),
        cloud.clone(),
        gateway.clone(),
        gateway.clone(),
        Arc::new(config),
    );
    let service = SessionService::new(registry.clone());
    Harness {
        store,
        cloud,
        gateway,
        registry,
        service,
    }
}

/// Seed a running, healthy, pooled instance.
pub async fn seed_available_instance(harness: &Harness, instance_id: &str, plan: PlanTier, ip: &str) {
    harness
        .cloud
        .add_instance(&group_for(plan), instance_id, InstanceState::Running, ip);
    harness
        .store
        .put_obj(&InstanceRecord {
            instance_id: instance_id.to_string(),
            status: InstanceStatus::Available,
            plan,
            discovered_at: Some(now_ts()),
            ..Default::default()
        })
        .await
        .unwrap();
}

/// Seed a session record directly.
pub async fn seed_session(harness: &Harness, session: &Session) {
    harness.store.put_obj(session).await.unwrap();
}

pub fn ready_session(owner: &str, plan: PlanTier, connection_id: Option<&str>) -> Session {
    let mut session = Session::new_pending(owner, owner, plan, 4 * 3600, now_ts());
    session.status = SessionStatus::Ready;
    if let Some(connection_id) = connection_id {
        let mut info = ConnectionInfo::new(PUBLIC_BASE, "10.0.0.50");
        info.connection_id = Some(connection_id.to_string());
        info.ephemeral_user = Some(format!("session_{}", session.session_id.tail()));
        session.connection_info = Some(info);
    }
    session
}

pub async fn stored_session(harness: &Harness, session_id: &labpool_common::types::session::SessionId) -> Session {
    harness
        .store
        .get_obj(&SessionKey::from(session_id))
        .await
        .unwrap()
}

pub async fn stored_instance(harness: &Harness, instance_id: &str) -> InstanceRecord {
    harness
        .store
        .get_obj(&InstanceRecordKey::from(instance_id))
        .await
        .unwrap()
}

/// Forge a signed portal token the way the portal does.
pub fn forge_token(claims: serde_json::Value) -> String {
    let payload = base64::encode_config(claims.to_string(), base64::URL_SAFE_NO_PAD);
    let mut mac = Hmac::<Sha256>::new_from_slice(PORTAL_SECRET.as_bytes()).unwrap();
    mac.update(payload.as_bytes());
    format!("{}.{}", payload, hex::encode(mac.finalize().into_bytes()))
}

pub fn portal_claims(user_id: &str, plan: &str, quota: i64, nonce: &str) -> serde_json::Value {
    serde_json::json!({
        "user_id": user_id,
        "username": user_id,
        "fullname": format!("User {}", user_id),
        "email": format!("{}@example.com", user_id),
        "plan": plan,
        "quota_minutes": quota,
        "roles": ["student"],
        "expires": now_ts() + 60,
        "nonce": nonce,
        "site_url": "https://portal.example.com",
    })
}
