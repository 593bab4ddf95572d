//! Boundary to the on-chain escrow service.
//!
//! The contract is opaque here: the orchestrator only submits the two
//! transactions it needs and polls their status. [`decode_engagement_id`]
//! owns the one piece of result-payload interpretation the flow depends on.

use std::{fmt, future::Future};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::Address;

mod simulated;

pub use simulated::SimulatedChain;

pub type EngagementId = u64;
pub type Amount = u64;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct TxRef(pub String);

impl TxRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TxRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateEngagement {
    pub client: Address,
    pub talent: Address,
    pub scout: Option<Address>,
    pub scout_fee_percent: Option<u8>,
    pub amount: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Success { payload: Value },
    Aborted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// Network or node failure; the call may be repeated.
    #[error("chain transport error: {0}")]
    Transport(String),
    /// The node or wallet refused the submission outright.
    #[error("submission refused: {0}")]
    Refused(String),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transport(_))
    }
}

pub trait EscrowChain: Send + Sync {
    fn submit_create(
        &self,
        params: &CreateEngagement,
    ) -> impl Future<Output = Result<TxRef, ChainError>> + Send;

    fn submit_fund(
        &self,
        engagement_id: EngagementId,
        amount: Amount,
    ) -> impl Future<Output = Result<TxRef, ChainError>> + Send;

    fn transaction_status(
        &self,
        tx: &TxRef,
    ) -> impl Future<Output = Result<TxStatus, ChainError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot decode engagement id: {0}")]
pub struct PayloadError(pub String);

const ID_KEYS: [&str; 2] = ["engagement_id", "project_id"];
const CREATED_EVENTS: [&str; 2] = ["ProjectCreated", "EngagementCreated"];

/// Accepts a top-level `engagement_id`/`project_id` or a `*ProjectCreated` /
/// `*EngagementCreated` event; ids may be numbers or decimal strings.
pub fn decode_engagement_id(payload: &Value) -> Result<EngagementId, PayloadError> {
    if let Some(id) = id_field(payload)? {
        return Ok(id);
    }
    let events = payload
        .get("events")
        .and_then(Value::as_array)
        .ok_or_else(|| PayloadError("no engagement id and no events".into()))?;
    for event in events {
        let is_created = event
            .get("type")
            .and_then(Value::as_str)
            .map(|ty| CREATED_EVENTS.iter().any(|name| ty.ends_with(name)))
            .unwrap_or(false);
        if !is_created {
            continue;
        }
        let data = event
            .get("data")
            .ok_or_else(|| PayloadError("creation event without data".into()))?;
        return id_field(data)?
            .ok_or_else(|| PayloadError("creation event without an id field".into()));
    }
    Err(PayloadError("no creation event in payload".into()))
}

fn id_field(object: &Value) -> Result<Option<EngagementId>, PayloadError> {
    for key in ID_KEYS {
        let Some(raw) = object.get(key) else {
            continue;
        };
        let id = match raw {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        return id
            .map(Some)
            .ok_or_else(|| PayloadError(format!("{key} is not an unsigned integer: {raw}")));
    }
    Ok(None)
}
