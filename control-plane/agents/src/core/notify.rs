//! Push-notification fan-out. The control plane resolves which subscribers
//! care about a session change; the transport that actually delivers the
//! event is an external collaborator behind [`PushTransport`].

use labpool_common::{
    now_ts,
    store::definitions::{StorableObjectType, Store},
    types::{
        session::{Session, SessionStatus},
        subscriber::Subscriber,
    },
};
use serde::Serialize;
use std::sync::Arc;

/// A session change worth telling subscribers about.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub owner_id: String,
    pub status: SessionStatus,
    pub at: i64,
}

impl SessionEvent {
    pub fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id.to_string(),
            owner_id: session.owner_id.clone(),
            status: session.status,
            at: now_ts(),
        }
    }
}

/// Delivery of one event to one subscriber.
#[async_trait::async_trait]
pub trait PushTransport: Send + Sync {
    async fn push(&self, subscriber: &Subscriber, event: &SessionEvent);
}

/// Default transport: log the event and move on.
pub struct TracingPush;

#[async_trait::async_trait]
impl PushTransport for TracingPush {
    async fn push(&self, subscriber: &Subscriber, event: &SessionEvent) {
        tracing::debug!(
            subscriber.connection = %subscriber.connection_id,
            session.id = %event.session_id,
            session.status = %event.status,
            "Session event"
        );
    }
}

/// Resolves subscribers for a session and hands events to the transport.
/// Every step is best-effort: a broken push subsystem never fails a session
/// transition.
pub struct Notifier<S: Store> {
    store: S,
    transport: Arc<dyn PushTransport>,
}

impl<S: Store> Clone for Notifier<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            transport: self.transport.clone(),
        }
    }
}

impl<S: Store> Notifier<S> {
    pub fn new(store: S, transport: Arc<dyn PushTransport>) -> Self {
        Self { store, transport }
    }

    pub async fn session_changed(&self, session: &Session) {
        let subscribers: Vec<Subscriber> = match self
            .store
            .get_prefix(StorableObjectType::Subscriber)
            .await
        {
            Ok(subscribers) => subscribers,
            Err(error) => {
                tracing::warn!(%error, "Failed to resolve push subscribers");
                return;
            }
        };
        let event = SessionEvent::from(session);
        let now = event.at;
        for subscriber in subscribers
            .iter()
            .filter(|sub| sub.wants(&session.session_id, &session.owner_id, now))
        {
            self.transport.push(subscriber, &event).await;
        }
    }
}
