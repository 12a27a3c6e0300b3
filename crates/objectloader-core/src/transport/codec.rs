//! Frame payloads carried by the worker rings
//!
//! Request frames (main → worker) are the UTF-8 object id.
//!
//! Outcome frames (worker → main):
//!
//! ```text
//! [tag u8][id_len u32 LE][id bytes][body]
//! ```
//!
//! where the tag is [`TAG_FOUND`] with the base JSON as body, or
//! [`TAG_MISSING`] with a UTF-8 reason as body.

use crate::types::{FetchOutcome, Item};

use super::TransportError;

/// Outcome tag for a fetched object
pub const TAG_FOUND: u8 = 1;
/// Outcome tag for an id that could not be fetched
pub const TAG_MISSING: u8 = 2;

const OUTCOME_PREFIX_LEN: usize = 1 + 4;

pub fn encode_request(base_id: &str) -> Vec<u8> {
    base_id.as_bytes().to_vec()
}

pub fn decode_request(frame: &[u8]) -> Result<String, TransportError> {
    String::from_utf8(frame.to_vec())
        .map_err(|e| TransportError::Malformed(format!("request id is not UTF-8: {e}")))
}

pub fn encode_outcome(outcome: &FetchOutcome) -> Result<Vec<u8>, TransportError> {
    let (tag, id, body) = match outcome {
        FetchOutcome::Found(item) => {
            let json = serde_json::to_vec(item.base.as_ref())
                .map_err(|e| TransportError::Malformed(format!("unencodable base: {e}")))?;
            (TAG_FOUND, item.base_id.as_str(), json)
        }
        FetchOutcome::Missing { base_id, reason } => {
            (TAG_MISSING, base_id.as_str(), reason.as_bytes().to_vec())
        }
    };

    let mut frame = Vec::with_capacity(OUTCOME_PREFIX_LEN + id.len() + body.len());
    frame.push(tag);
    frame.extend_from_slice(&(id.len() as u32).to_le_bytes());
    frame.extend_from_slice(id.as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode_outcome(frame: &[u8]) -> Result<FetchOutcome, TransportError> {
    if frame.len() < OUTCOME_PREFIX_LEN {
        return Err(TransportError::Malformed(format!(
            "outcome frame of {} bytes",
            frame.len()
        )));
    }
    let tag = frame[0];
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&frame[1..OUTCOME_PREFIX_LEN]);
    let id_len = u32::from_le_bytes(len_bytes) as usize;

    let rest = &frame[OUTCOME_PREFIX_LEN..];
    if id_len > rest.len() {
        return Err(TransportError::Malformed(format!(
            "id length {id_len} exceeds frame"
        )));
    }
    let (id, body) = rest.split_at(id_len);
    let id = std::str::from_utf8(id)
        .map_err(|e| TransportError::Malformed(format!("outcome id is not UTF-8: {e}")))?
        .to_string();

    match tag {
        TAG_FOUND => {
            let text = std::str::from_utf8(body)
                .map_err(|e| TransportError::Malformed(format!("base is not UTF-8: {e}")))?;
            let mut item = Item::from_json(text)
                .map_err(|e| TransportError::Malformed(format!("bad base JSON for '{id}': {e}")))?;
            item.base_id = id;
            Ok(FetchOutcome::Found(item))
        }
        TAG_MISSING => Ok(FetchOutcome::Missing {
            base_id: id,
            reason: String::from_utf8_lossy(body).into_owned(),
        }),
        other => Err(TransportError::Malformed(format!("unknown outcome tag {other}"))),
    }
}
