//! Host-facing export of every model, for persistence across restarts.
//!
//! The engine never touches disk. The host takes a [`Snapshot`] from
//! [`Engine::snapshot`](crate::Engine::snapshot), stores it however it
//! likes, and later hands it back through
//! [`EngineBuilder::restore_snapshot`](crate::EngineBuilder::restore_snapshot).

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// A point-in-time copy of every model in an engine, in registration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "M: Serialize", deserialize = "M: DeserializeOwned"))]
pub struct Snapshot<M> {
    /// The models, one per kind.
    pub models: Vec<M>,
}

impl<M> Snapshot<M> {
    /// Wrap a set of models.
    pub fn new(models: Vec<M>) -> Self {
        Self { models }
    }

    /// Unwrap into the model list.
    pub fn into_models(self) -> Vec<M> {
        self.models
    }
}

impl<M: Serialize + DeserializeOwned> Snapshot<M> {
    /// Encode as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if a model fails to serialize.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode from JSON.
    ///
    /// # Returns
    ///
    /// - `Some(snapshot)` if `bytes` is a valid encoded snapshot.
    /// - `None` otherwise. The decode error is logged via `tracing::warn!`
    ///   and the caller should start from its initial models.
    pub fn from_json(bytes: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<Self>(bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    len = bytes.len(),
                    "failed to deserialize snapshot; starting from initial models"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::test_fixtures::{AppModel, Counter, Sender};
    use crate::request::RequestId;

    #[test]
    fn json_roundtrip_keeps_order_and_payloads() {
        let snapshot = Snapshot::new(vec![
            AppModel::Counter(Counter { value: 3 }),
            AppModel::Sender(Sender::Sending {
                request: RequestId::from_raw(8),
            }),
        ]);
        let bytes = snapshot.to_json().expect("models should serialize");
        let decoded = Snapshot::<AppModel>::from_json(&bytes).expect("valid json should decode");
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn corrupt_json_is_none() {
        assert!(Snapshot::<AppModel>::from_json(b"this is not valid json!!!").is_none());
    }

    #[test]
    fn into_models_unwraps() {
        let snapshot = Snapshot::new(vec![AppModel::Sender(Sender::Idle)]);
        assert_eq!(snapshot.into_models(), vec![AppModel::Sender(Sender::Idle)]);
    }
}
