//! Request surfaces: the trusted control surface (stdio) and the
//! origin-stamped dApp relay (unix socket). Both speak line-delimited JSON
//! and wrap every outcome in the uniform success/failure envelope.

pub mod dapp;
pub mod handlers;
pub mod server;
pub mod transport;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::ErrorBody;

pub const MAX_LINE_BYTES: usize = 1_000_000;

/// A trusted-surface request frame.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: Value,
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

pub fn ok(id: Value, data: Value) -> Value {
    json!({ "id": id, "success": true, "data": data })
}

pub fn fail(id: Value, error: ErrorBody) -> Value {
    json!({ "id": id, "success": false, "error": error })
}

/// An unsolicited event frame (no `id`, never a response).
pub fn event(kind: &str, data: Value) -> Value {
    json!({ "kind": kind, "data": data })
}
