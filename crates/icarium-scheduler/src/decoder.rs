//! Queue message decoding.
//!
//! A queue message is an envelope whose `Message` field holds the payload as
//! a JSON string:
//!
//! ```json
//! {"Message": "{\"action\":\"build\",\"data\":{\"provider\":\"github\",\"repository\":\"acme/widget\",\"ref\":\"refs/tags/v1.0\",\"commit\":\"abc123\"}}"}
//! ```

use icarium_core::{Action, BuildTriggerEvent};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

const PAYLOAD_FIELD: &str = "Message";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("envelope has no string 'Message' field")]
    MissingPayload,

    #[error("malformed payload: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("build payload is missing '{0}'")]
    MissingField(&'static str),
}

#[derive(Debug, Deserialize)]
struct TriggerPayload {
    action: Action,
    #[serde(default)]
    data: TriggerData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TriggerData {
    provider: String,
    repository: String,
    #[serde(rename = "ref")]
    git_ref: String,
    commit: String,
}

/// Decode one raw queue message into a trigger event.
///
/// Non-build actions decode with whatever data they carry; only `build`
/// payloads must name a repository, ref and commit.
pub fn decode_message(body: &str) -> Result<BuildTriggerEvent, DecodeError> {
    let envelope: HashMap<String, Value> =
        serde_json::from_str(body).map_err(DecodeError::Envelope)?;

    let payload = match envelope.get(PAYLOAD_FIELD) {
        Some(Value::String(s)) => s,
        _ => return Err(DecodeError::MissingPayload),
    };

    let payload: TriggerPayload = serde_json::from_str(payload).map_err(DecodeError::Payload)?;
    let data = payload.data;

    if payload.action == Action::Build {
        for (field, value) in [
            ("provider", &data.provider),
            ("repository", &data.repository),
            ("ref", &data.git_ref),
            ("commit", &data.commit),
        ] {
            if value.is_empty() {
                return Err(DecodeError::MissingField(field));
            }
        }
    }

    Ok(BuildTriggerEvent {
        action: payload.action,
        provider: data.provider,
        repository_full_name: data.repository,
        r#ref: data.git_ref,
        commit: data.commit,
    })
}
