//! Transparent message encryption
//!
//! Hook point for hosts that persist message transcripts. The whole message
//! is sealed under its agent's key and stored in a `_vault` field;
//! `content` is replaced by a placeholder and every other field is left as
//! it was. A message that already carries `_vault` passes through
//! untouched, so wrapping twice is the same as wrapping once.

use coffer_crypto::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::service::{Result, VaultError, VaultService};

pub const ENCRYPTED_PLACEHOLDER: &str = "__VAULT_ENCRYPTED__";
pub const VAULT_FIELD: &str = "_vault";
pub const DEFAULT_AGENT_ID: &str = "default";

const WRAP_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct WrappedPayload {
    v: u32,
    #[serde(flatten)]
    envelope: Envelope,
}

pub fn is_wrapped(message: &Value) -> bool {
    message.get(VAULT_FIELD).is_some_and(|v| !v.is_null())
}

impl VaultService {
    /// Seal a message object for `agent_id` (or the default agent)
    pub fn wrap_message(&self, agent_id: Option<&str>, message: Value) -> Result<Value> {
        if is_wrapped(&message) {
            return Ok(message);
        }
        let Value::Object(mut fields) = message else {
            return Err(VaultError::InvalidMessage("message must be a JSON object"));
        };

        let plaintext = Zeroizing::new(serde_json::to_vec(&fields)?);
        let envelope = self.seal_for_agent(agent_id.unwrap_or(DEFAULT_AGENT_ID), &plaintext)?;

        fields.insert("content".to_string(), Value::from(ENCRYPTED_PLACEHOLDER));
        fields.insert(
            VAULT_FIELD.to_string(),
            serde_json::to_value(WrappedPayload {
                v: WRAP_VERSION,
                envelope,
            })?,
        );
        Ok(Value::Object(fields))
    }

    /// Recover the original message
    ///
    /// A message without `_vault` is returned as-is. `None` means the
    /// envelope did not open under the agent's key.
    pub fn unwrap_message(&self, agent_id: Option<&str>, message: &Value) -> Result<Option<Value>> {
        if !is_wrapped(message) {
            return Ok(Some(message.clone()));
        }

        let payload: WrappedPayload = serde_json::from_value(message[VAULT_FIELD].clone())
            .map_err(|_| VaultError::InvalidMessage("unrecognized _vault payload"))?;
        if payload.v != WRAP_VERSION {
            return Err(VaultError::InvalidMessage("unsupported _vault version"));
        }

        let opened = self.open_for_agent(agent_id.unwrap_or(DEFAULT_AGENT_ID), &payload.envelope)?;
        match opened {
            Some(plaintext) => Ok(Some(serde_json::from_slice(&plaintext)?)),
            None => Ok(None),
        }
    }
}
