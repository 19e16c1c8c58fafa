use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Storage operation kinds that carry a client acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOpKind {
    Set,
    Get,
    Remove,
    Clear,
}

/// Server → page storage operation.
///
/// `request_id` is present only when the server registered a callback for the
/// client acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StorageOp {
    SetItem {
        request_id: Option<u32>,
        key: String,
        value: String,
        time: i64,
    },
    GetItem {
        request_id: u32,
        key: String,
    },
    RemoveItem {
        request_id: Option<u32>,
        key: String,
        time: i64,
    },
    RemoveAndGetItem {
        request_id: u32,
        key: String,
        time: i64,
    },
    ClearItems {
        request_id: Option<u32>,
        time: i64,
    },
    SetToken {
        key: String,
        value: Option<String>,
        time: i64,
        id: i32,
    },
}

/// Page acknowledgment of an item operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAck {
    pub kind: ItemOpKind,
    pub request_id: u32,
    /// Value seen by the page, for get / remove-and-get.
    #[serde(default)]
    pub value: Option<String>,
    /// Write time of `value` as recorded by the page.
    #[serde(default)]
    pub updated_time: Option<i64>,
}

/// Page-originated token write, ordered by `(time, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenWrite {
    pub key: String,
    pub value: Option<String>,
    pub time: i64,
    pub id: i32,
}

/// Page → server storage message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ItemAck(ItemAck),
    TokenWrite(TokenWrite),
}

/// Encodes a storage operation as CBOR.
pub fn encode_storage_op(op: &StorageOp) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    ciborium::into_writer(op, &mut out)?;
    Ok(out)
}

/// Decodes a storage operation from CBOR.
pub fn decode_storage_op(bytes: &[u8]) -> Result<StorageOp, CodecError> {
    Ok(ciborium::from_reader(bytes)?)
}

/// Encodes a page → server message as CBOR.
pub fn encode_client_message(msg: &ClientMessage) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    ciborium::into_writer(msg, &mut out)?;
    Ok(out)
}

/// Decodes a page → server message from CBOR.
pub fn decode_client_message(bytes: &[u8]) -> Result<ClientMessage, CodecError> {
    Ok(ciborium::from_reader(bytes)?)
}
