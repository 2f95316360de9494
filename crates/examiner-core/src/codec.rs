//! JSON codec for the examiner wire protocol.
//!
//! Every logical message is one JSON document carried in one transport
//! message; there is no length prefix or partial-document reassembly here.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ExaminerError, ExaminerResult};
use crate::messages::Inbound;

/// Encode a serializable value into one JSON document.
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> ExaminerResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode one JSON document into a typed value.
pub fn decode_json<T: DeserializeOwned>(data: &[u8]) -> ExaminerResult<T> {
    Ok(serde_json::from_slice(data)?)
}

/// Decode an inbound envelope.
///
/// Malformed JSON is a `Codec` error; a well-formed document with a missing
/// or unknown `method`, or with missing `id`/`params`, is `InvalidMessage`.
pub fn decode_envelope(data: &[u8]) -> ExaminerResult<Inbound> {
    let value: Value = serde_json::from_slice(data)?;

    let method = match value.get("method") {
        Some(Value::String(m)) => m.clone(),
        Some(_) => return Err(ExaminerError::InvalidMessage("`method` is not a string".into())),
        None => return Err(ExaminerError::InvalidMessage("missing `method`".into())),
    };

    serde_json::from_value(value)
        .map_err(|e| ExaminerError::InvalidMessage(format!("{method}: {e}")))
}

/// Decode `execute` params against the type a receiver declared.
pub fn decode_params<T: DeserializeOwned>(method: &str, params: Value) -> ExaminerResult<T> {
    serde_json::from_value(params).map_err(|e| ExaminerError::ParamsMismatch {
        method: method.to_string(),
        reason: e.to_string(),
    })
}
