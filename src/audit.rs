//! Structured audit events
//!
//! The engine reports every security-relevant operation to the audit
//! collaborator through tracing. Events carry identifiers and outcomes only;
//! plaintext and key material never appear in an event.

use serde::{Deserialize, Serialize};

/// Audited engine action
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Encrypt,
    Decrypt,
    Rotate,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Encrypt => "ENCRYPT",
            AuditAction::Decrypt => "DECRYPT",
            AuditAction::Rotate => "ROTATE",
        }
    }
}

/// Emit a structured audit event.
///
/// `entity_id` is the record or document the operation touched, when the
/// caller supplied one; `key_version` is the version involved.
pub fn record(
    action: AuditAction,
    organization_id: &str,
    entity_id: Option<&str>,
    key_version: u32,
    outcome: &str,
) {
    tracing::info!(
        target: "tenantseal::audit",
        action = action.as_str(),
        organization_id,
        entity_id = entity_id.unwrap_or("-"),
        key_version,
        outcome,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_labels() {
        assert_eq!(AuditAction::Encrypt.as_str(), "ENCRYPT");
        assert_eq!(AuditAction::Decrypt.as_str(), "DECRYPT");
        assert_eq!(AuditAction::Rotate.as_str(), "ROTATE");
    }

    #[test]
    fn test_action_serde_format() {
        let json = serde_json::to_string(&AuditAction::Rotate).unwrap();
        assert_eq!(json, "\"ROTATE\"");
    }
}
