use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("subscribe to {topic} failed: {message}")]
    SubscribeFailed { topic: String, message: String },
}

/// A live registration returned by [`EventBridge::subscribe`].
pub struct Registration {
    pub id: u64,
    pub events: mpsc::UnboundedReceiver<serde_json::Value>,
}

/// Push channel from the device backend. Events flow until `unsubscribe`.
#[async_trait]
pub trait EventBridge: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<Registration, BridgeError>;

    fn unsubscribe(&self, id: u64);
}

pub type Dispatch = Arc<dyn Fn(&str, serde_json::Value) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub topic: String,
}

struct ActiveSubscription {
    handle: SubscriptionHandle,
    pump: JoinHandle<()>,
}

/// Keeps one bridge registration per topic and forwards its payloads to
/// `dispatch`.
pub struct SubscriptionManager {
    bridge: Arc<dyn EventBridge>,
    dispatch: Dispatch,
    active: Mutex<HashMap<String, ActiveSubscription>>,
}

impl SubscriptionManager {
    pub fn new(bridge: Arc<dyn EventBridge>, dispatch: Dispatch) -> Self {
        Self {
            bridge,
            dispatch,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub async fn ensure_subscribed(&self, topic: &str) -> Result<SubscriptionHandle, BridgeError> {
        let mut active = self.active.lock().await;
        if let Some(sub) = active.get(topic) {
            if !sub.pump.is_finished() {
                return Ok(sub.handle.clone());
            }
            debug!(topic, "event stream ended, subscribing again");
            self.bridge.unsubscribe(sub.handle.id);
            active.remove(topic);
        }

        let Registration { id, mut events } = self.bridge.subscribe(topic).await?;
        let handle = SubscriptionHandle {
            id,
            topic: topic.to_string(),
        };

        let dispatch = self.dispatch.clone();
        let pump_topic = topic.to_string();
        let pump = tokio::spawn(async move {
            while let Some(payload) = events.recv().await {
                dispatch(&pump_topic, payload);
            }
            debug!(topic = %pump_topic, "event stream closed");
        });

        debug!(topic, id, "subscribed");
        active.insert(
            topic.to_string(),
            ActiveSubscription {
                handle: handle.clone(),
                pump,
            },
        );
        Ok(handle)
    }

    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.active.lock().await.contains_key(topic)
    }

    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let removed = self.active.lock().await.remove(topic);
        match removed {
            Some(sub) => {
                self.teardown(sub);
                true
            }
            None => false,
        }
    }

    /// Drops every registration.
    pub async fn reset(&self) {
        let drained: Vec<ActiveSubscription> =
            self.active.lock().await.drain().map(|(_, s)| s).collect();
        for sub in drained {
            self.teardown(sub);
        }
    }

    fn teardown(&self, sub: ActiveSubscription) {
        sub.pump.abort();
        self.bridge.unsubscribe(sub.handle.id);
        debug!(topic = %sub.handle.topic, id = sub.handle.id, "unsubscribed");
    }
}
