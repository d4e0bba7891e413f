//! Tool definitions and execution
//!
//! The vault's tool-call surface for agent hosts: schemas in the
//! OpenAI-compatible function format plus a dispatcher. Results are JSON
//! objects with either a payload or an `error` string, never a panic.

use serde_json::{json, Value};

use crate::service::VaultService;
use crate::transform::DEFAULT_AGENT_ID;

/// All vault tool definitions as OpenAI-compatible function schemas
pub fn tool_schemas() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": "vault_read",
                "description": "Read encrypted file from vault",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "file_path": { "type": "string", "description": "Path of the file to read from vault" },
                        "agent_id": { "type": "string", "description": "Agent ID (defaults to current agent)" }
                    },
                    "required": ["file_path"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "vault_write",
                "description": "Write encrypted file to vault",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "file_path": { "type": "string", "description": "Path of the file to store in vault" },
                        "content": { "type": "string", "description": "Content to encrypt and store" },
                        "agent_id": { "type": "string", "description": "Agent ID (defaults to current agent)" }
                    },
                    "required": ["file_path", "content"]
                }
            }
        }),
    ]
}

/// Execute a vault tool by name
///
/// Returns `None` for names this module does not own, so the caller can
/// try its other tool sources.
pub fn execute_tool(vault: &VaultService, name: &str, args: &Value) -> Option<Value> {
    match name {
        "vault_read" => Some(tool_vault_read(vault, args)),
        "vault_write" => Some(tool_vault_write(vault, args)),
        _ => None,
    }
}

fn error(message: impl Into<String>) -> Value {
    json!({ "error": message.into() })
}

fn agent_id(args: &Value) -> &str {
    args["agent_id"]
        .as_str()
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_AGENT_ID)
}

fn tool_vault_read(vault: &VaultService, args: &Value) -> Value {
    let Some(file_path) = args["file_path"].as_str() else {
        return error("Missing required parameter: file_path");
    };

    match vault.decrypt_and_read_string(agent_id(args), file_path) {
        Ok(Some(content)) => json!({ "content": content }),
        Ok(None) => error("File not found in vault"),
        Err(e) => error(e.to_string()),
    }
}

fn tool_vault_write(vault: &VaultService, args: &Value) -> Value {
    let (Some(file_path), Some(content)) = (args["file_path"].as_str(), args["content"].as_str()) else {
        return error("Missing required parameters: file_path, content");
    };

    match vault.encrypt_and_store(agent_id(args), file_path, content) {
        Ok(()) => json!({
            "success": true,
            "message": format!("File encrypted and stored: {}", file_path)
        }),
        Err(e) => error(e.to_string()),
    }
}
