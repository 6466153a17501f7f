//! Stratum v1 message types and JSON-RPC serialization.
//!
//! Messages are JSON-RPC-like objects, one per line. Stratum predates
//! JSON-RPC 2.0 and bends it: notifications carry `"id": null` instead of
//! omitting the id, errors are `[code, "message", data]` arrays, and there
//! is no version field. A small untagged enum fits that better than a
//! general JSON-RPC library.

use bitcoin::block::Version;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job_source::{SessionId, ShareOutcome};
use crate::types::Difficulty;

/// Events emitted by the Stratum client, in the order the pool sent them.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Subscribe succeeded and a new session began.
    ///
    /// Everything from earlier sessions is void from here on.
    Subscribed {
        session: SessionId,
        extranonce1: Vec<u8>,
        extranonce2_size: u8,
        /// Version mask granted by `mining.configure`, if any
        version_mask: Option<u32>,
    },

    /// Authorize succeeded; shares may be submitted from here on.
    Authorized { session: SessionId },

    /// New mining job received from pool
    NewJob(JobNotification),

    DifficultyChanged(Difficulty),

    /// Version mask changed (mining.set_version_mask)
    VersionMaskSet(u32),

    /// Pool verdict on a share, or the lack of one
    ShareResult {
        job_id: String,
        nonce: u32,
        outcome: ShareOutcome,
    },

    /// Connection lost; the client is reconnecting
    Disconnected,
}

/// Commands sent to the Stratum client.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    SubmitShare(SubmitParams),
}

/// Mining job notification from pool (mining.notify).
#[derive(Debug, Clone, PartialEq)]
pub struct JobNotification {
    pub job_id: String,

    pub prev_hash: BlockHash,

    /// First part of coinbase transaction (before extranonce)
    pub coinbase1: Vec<u8>,

    /// Second part of coinbase transaction (after extranonce)
    pub coinbase2: Vec<u8>,

    pub merkle_branches: Vec<TxMerkleNode>,

    pub version: Version,

    /// Encoded network target
    pub nbits: CompactTarget,

    pub ntime: u32,

    /// If true, abandon all previous jobs
    pub clean_jobs: bool,
}

impl JobNotification {
    /// Parse from Stratum JSON array parameters.
    ///
    /// Converts hex strings from the pool protocol into typed Bitcoin
    /// structures. Parsed by hand for better error context than serde tuple
    /// structs would give.
    pub fn from_stratum_params(params: &[Value]) -> Result<Self, String> {
        if params.len() < 9 {
            return Err(format!("expected 9 params, got {}", params.len()));
        }

        let job_id = params[0].as_str().ok_or("job_id not a string")?.to_string();

        let prev_hash_str = params[1].as_str().ok_or("prev_hash not a string")?;
        let prev_hash = parse_block_hash(prev_hash_str)?;

        let coinbase1_str = params[2].as_str().ok_or("coinbase1 not a string")?;
        let coinbase1 = hex::decode(coinbase1_str).map_err(|e| format!("coinbase1 hex: {}", e))?;

        let coinbase2_str = params[3].as_str().ok_or("coinbase2 not a string")?;
        let coinbase2 = hex::decode(coinbase2_str).map_err(|e| format!("coinbase2 hex: {}", e))?;

        let branches_json = params[4].as_array().ok_or("merkle_branches not an array")?;
        let merkle_branches = branches_json
            .iter()
            .map(|branch| {
                branch
                    .as_str()
                    .ok_or_else(|| "merkle branch not a string".to_string())
                    .and_then(parse_merkle_node)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let version = parse_hex_u32(&params[5], "version")?;
        let version = Version::from_consensus(version as i32);

        let nbits = CompactTarget::from_consensus(parse_hex_u32(&params[6], "nbits")?);
        let ntime = parse_hex_u32(&params[7], "ntime")?;

        let clean_jobs = params[8].as_bool().ok_or("clean_jobs not a bool")?;

        Ok(Self {
            job_id,
            prev_hash,
            coinbase1,
            coinbase2,
            merkle_branches,
            version,
            nbits,
            ntime,
            clean_jobs,
        })
    }
}

fn parse_hex_u32(value: &Value, field: &str) -> Result<u32, String> {
    let s = value
        .as_str()
        .ok_or_else(|| format!("{} not a string", field))?;
    u32::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| format!("{} hex: {}", field, e))
}

/// Parse a block hash from Stratum's word-swapped hex.
///
/// Stratum sends the previous block hash as eight 32-bit words, each printed
/// big-endian. Reversing the bytes within each 4-byte word yields the
/// internal (little-endian) byte order.
///
/// ```text
/// Stratum:  6b6455fd 6db962c1 01f2d4fc ...
/// Internal: fd55646b c162b96d fcd4f201 ...
/// ```
pub(crate) fn parse_block_hash(hex: &str) -> Result<BlockHash, String> {
    let mut bytes = hex::decode(hex).map_err(|e| format!("block hash hex: {}", e))?;
    if bytes.len() != 32 {
        return Err(format!("block hash wrong length: {}", bytes.len()));
    }

    for chunk in bytes.chunks_mut(4) {
        chunk.reverse();
    }

    BlockHash::from_slice(&bytes).map_err(|e| format!("block hash parse: {}", e))
}

/// Inverse of [`parse_block_hash`].
#[cfg(test)]
pub(crate) fn format_block_hash(hash: &BlockHash) -> String {
    let mut bytes = hash.to_byte_array();
    for chunk in bytes.chunks_mut(4) {
        chunk.reverse();
    }
    hex::encode(bytes)
}

/// Merkle branches are sent in internal byte order, no swapping.
fn parse_merkle_node(hex: &str) -> Result<TxMerkleNode, String> {
    let bytes = hex::decode(hex).map_err(|e| format!("merkle node hex: {}", e))?;
    if bytes.len() != 32 {
        return Err(format!("merkle node wrong length: {}", bytes.len()));
    }
    TxMerkleNode::from_slice(&bytes).map_err(|e| format!("merkle node parse: {}", e))
}

/// Parameters for submitting a share to the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitParams {
    /// Session the share was found under; the client drops it if the
    /// session has since been replaced.
    pub session: SessionId,

    pub username: String,

    pub job_id: String,

    /// Extranonce2 bytes in coinbase order
    pub extranonce2: Vec<u8>,

    pub ntime: u32,

    pub nonce: u32,

    /// Rolled version bits, only when version rolling is active
    pub version_bits: Option<u32>,
}

impl SubmitParams {
    /// Convert to the `mining.submit` parameter array.
    pub fn to_stratum_json(&self) -> Vec<Value> {
        let mut params = vec![
            Value::String(self.username.clone()),
            Value::String(self.job_id.clone()),
            Value::String(hex::encode(&self.extranonce2)),
            Value::String(format!("{:08x}", self.ntime)),
            Value::String(format!("{:08x}", self.nonce)),
        ];

        if let Some(version_bits) = self.version_bits {
            params.push(Value::String(format!("{:08x}", version_bits)));
        }

        params
    }
}

/// JSON-RPC message envelope.
///
/// Requests and notifications share a shape; notifications have a null id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request {
        /// Message ID (null for notifications)
        id: Option<u64>,
        method: String,
        params: Value,
    },

    Response {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

impl JsonRpcMessage {
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn id(&self) -> Option<u64> {
        match self {
            JsonRpcMessage::Request { id, .. } => *id,
            JsonRpcMessage::Response { id, .. } => Some(*id),
        }
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Request { id: None, .. })
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}

/// Reason text from a Stratum error value.
///
/// Pools send `[code, "message", data]`; anything else is shown as-is.
pub(crate) fn error_reason(error: &Value) -> String {
    error
        .as_array()
        .and_then(|arr| arr.get(1))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}
