//! Approval records and the content hash they are validated against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// SHA-256 (lowercase hex) of the canonical JSON encoding of a step's `data`.
///
/// `serde_json` keeps object keys sorted, so equal values hash equally
/// regardless of insertion order.
pub fn content_hash(data: &JsonValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A human (or policy) sign-off on a proposed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approved_by: String,
    /// Hash of the output the approver looked at.
    pub content_hash: String,
    pub approved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ApprovalRecord {
    pub fn new(approved_by: impl Into<String>, content_hash: impl Into<String>, approved_at: DateTime<Utc>) -> Self {
        Self {
            approved_by: approved_by.into(),
            content_hash: content_hash.into(),
            approved_at,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn covers(&self, expected_hash: &str) -> bool {
        self.content_hash.eq_ignore_ascii_case(expected_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_ignores_key_order() {
        let a: JsonValue = serde_json::from_str(r#"{"patch":"diff","files":["a.rs"]}"#).unwrap();
        let b: JsonValue = serde_json::from_str(r#"{"files":["a.rs"],"patch":"diff"}"#).unwrap();
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_eq!(content_hash(&a).len(), 64);
    }

    #[test]
    fn hash_changes_with_content() {
        assert_ne!(content_hash(&json!({"patch": "a"})), content_hash(&json!({"patch": "b"})));
    }

    #[test]
    fn approval_covers_matching_hash_only() {
        let hash = content_hash(&json!({"patch": "a"}));
        let approval = ApprovalRecord::new("octocat", hash.to_uppercase(), Utc::now());
        assert!(approval.covers(&hash));
        assert!(!approval.covers(&content_hash(&json!({"patch": "b"}))));
    }
}
