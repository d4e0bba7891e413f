//! Persisted record types
//!
//! Timestamps are Unix epoch milliseconds.

use coffer_crypto::Envelope;
use serde::{Deserialize, Serialize};

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One agent's key, wrapped under the master key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentKeyRecord {
    pub agent_id: String,
    pub encrypted_key: Envelope,
    pub created_at: i64,
    pub last_rotated: i64,
    /// Key being rotated out. Present only while that agent's files are
    /// still being re-encrypted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_key: Option<Envelope>,
    /// Keys from finished rotations. Files are migrated off them, but
    /// envelopes handed to the host may still be sealed under one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retired_keys: Vec<Envelope>,
}

/// One stored payload, sealed under its agent's key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub file_path: String,
    pub encrypted_data: Envelope,
    pub original_path: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_crypto::{cipher, KdfParams, SymmetricKey};

    #[test]
    fn test_key_record_json_shape() {
        let key = SymmetricKey::generate().unwrap();
        let envelope = cipher::encrypt(&key, b"k", &KdfParams::new(1).unwrap()).unwrap();
        let record = AgentKeyRecord {
            agent_id: "agentA".into(),
            encrypted_key: envelope,
            created_at: 1,
            last_rotated: 2,
            previous_key: None,
            retired_keys: Vec::new(),
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["agentId"], "agentA");
        assert_eq!(json["lastRotated"], 2);
        assert!(json["encryptedKey"]["iv"].is_string());
        assert!(json.get("previousKey").is_none());
        assert!(json.get("retiredKeys").is_none());

        let back: AgentKeyRecord = serde_json::from_value(json).unwrap();
        assert!(back.previous_key.is_none());
        assert!(back.retired_keys.is_empty());
    }
}
