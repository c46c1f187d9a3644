//! Application messages routed between managers.

use crate::config::BusConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message addressed to a named queue on a directly connected peer.
///
/// `id` is assigned at construction and never changes; a reply carries the
/// original's `id` in `reply_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: Uuid,
    /// Sending manager. Filled in by `ConnectionManager::send` when absent.
    pub source: Option<String>,
    pub source_qname: String,
    /// Receiving manager, matched against the peer identity from the handshake.
    pub target: String,
    pub target_qname: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<Uuid>,
}

impl Message {
    /// Create a message for the `main` queue of `target`.
    pub fn new(target: impl Into<String>, data: impl Into<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: None,
            source_qname: BusConfig::DEFAULT_QUEUE_NAME.to_string(),
            target: target.into(),
            target_qname: BusConfig::DEFAULT_QUEUE_NAME.to_string(),
            data: data.into(),
            reply_to: None,
        }
    }

    /// Create a message carrying any serializable payload.
    pub fn with_payload<T: Serialize>(target: impl Into<String>, payload: &T) -> crate::Result<Self> {
        let data = serde_json::to_value(payload).map_err(|e| crate::BusError::Serialization {
            message: e.to_string(),
            source: Some(e),
        })?;
        Ok(Self::new(target, data))
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_source_qname(mut self, qname: impl Into<String>) -> Self {
        self.source_qname = qname.into();
        self
    }

    pub fn with_target_qname(mut self, qname: impl Into<String>) -> Self {
        self.target_qname = qname.into();
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Identifier of the message this one answers, if it is a reply.
    pub fn reply_to(&self) -> Option<Uuid> {
        self.reply_to
    }

    /// Build a reply addressed to this message's sender.
    ///
    /// Source and target (and their queue names) are swapped. A message whose
    /// `source` was never filled in produces a reply with an empty target.
    pub fn create_reply(&self, data: impl Into<serde_json::Value>) -> Message {
        Message {
            id: Uuid::new_v4(),
            source: Some(self.target.clone()),
            source_qname: self.target_qname.clone(),
            target: self.source.clone().unwrap_or_default(),
            target_qname: self.source_qname.clone(),
            data: data.into(),
            reply_to: Some(self.id),
        }
    }

    /// Deserialize the payload into a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(T::deserialize(&self.data)?)
    }
}
