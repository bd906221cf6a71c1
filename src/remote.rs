use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("unknown remote method: {method}")]
    UnknownMethod { method: String },

    #[error("invalid payload for {method}: {message}")]
    InvalidPayload { method: String, message: String },

    #[error("device not connected")]
    DeviceNotConnected,

    #[error("{method} failed: {message}")]
    Failed { method: String, message: String },
}

impl RemoteError {
    pub fn failed(method: &str, message: impl Into<String>) -> Self {
        RemoteError::Failed {
            method: method.to_string(),
            message: message.into(),
        }
    }
}

/// Request/response call into the device backend. Resolves once the backend
/// has accepted the request; completion is reported through the event bridge.
#[async_trait]
pub trait RemoteCaller: Send + Sync {
    async fn call(&self, method: &str, payload: serde_json::Value) -> Result<(), RemoteError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    pub enum Reply {
        Accept,
        Reject(String),
        /// Never settles.
        Pending,
    }

    pub struct FakeRemote {
        reply: Mutex<Reply>,
        calls: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl FakeRemote {
        pub fn new(reply: Reply) -> Self {
            Self {
                reply: Mutex::new(reply),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn set_reply(&self, reply: Reply) {
            *self.reply.lock().unwrap() = reply;
        }

        pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteCaller for FakeRemote {
        async fn call(&self, method: &str, payload: serde_json::Value) -> Result<(), RemoteError> {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), payload));
            let reply = self.reply.lock().unwrap().clone();
            match reply {
                Reply::Accept => Ok(()),
                Reply::Reject(message) => Err(RemoteError::failed(method, message)),
                Reply::Pending => std::future::pending().await,
            }
        }
    }
}
