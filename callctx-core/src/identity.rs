//! Identity types for callctx records

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Internal call identifier, UUIDv7 so sessions sort by creation time.
pub type CallId = Uuid;

/// Patient identifier as issued by the patient directory.
pub type PatientId = Uuid;

/// Identifier of a persisted transcript.
pub type TranscriptId = Uuid;

/// Voice-AI agent identifier (provider-assigned, opaque).
pub type AgentId = String;

/// Provider-assigned knowledge document id.
pub type SnippetHandle = String;

/// Provider-assigned conversation id, known only after the call connects.
pub type ConversationId = String;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// SHA-256 content hash.
pub type ContentHash = [u8; 32];

/// Prefix of every knowledge document name this system creates.
pub const SNIPPET_NAME_PREFIX: &str = "call-context-";

/// Generate a new UUIDv7 id (timestamp-sortable).
pub fn new_entity_id() -> Uuid {
    Uuid::now_v7()
}

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Hex-encoded SHA-256 of a string, used as a stable fingerprint.
pub fn content_fingerprint(content: &str) -> String {
    hex::encode(compute_content_hash(content.as_bytes()))
}

/// Creation time embedded in a UUIDv7 id.
pub fn id_timestamp(id: Uuid) -> Option<Timestamp> {
    let (secs, nanos) = id.get_timestamp()?.to_unix();
    DateTime::<Utc>::from_timestamp(secs as i64, nanos)
}

/// Provider-visible name of the snippet owned by `call_id`.
pub fn snippet_name(call_id: CallId) -> String {
    format!("{}{}", SNIPPET_NAME_PREFIX, call_id)
}

/// Recover the owning call id from a snippet name.
///
/// Returns `None` for documents this system did not create.
pub fn owner_from_snippet_name(name: &str) -> Option<CallId> {
    name.strip_prefix(SNIPPET_NAME_PREFIX)
        .and_then(|rest| Uuid::parse_str(rest.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entity_id_is_v7() {
        let id = new_entity_id();
        assert_eq!(id.get_version_num(), 7);
    }

    #[test]
    fn test_id_timestamp_close_to_now() {
        let id = new_entity_id();
        let at = id_timestamp(id).unwrap();
        assert!((Utc::now() - at).num_seconds().abs() < 5);
        assert!(id_timestamp(Uuid::nil()).is_none());
    }

    #[test]
    fn test_snippet_name_round_trips_owner() {
        let call_id = new_entity_id();
        let name = snippet_name(call_id);
        assert!(name.starts_with(SNIPPET_NAME_PREFIX));
        assert_eq!(owner_from_snippet_name(&name), Some(call_id));
    }

    #[test]
    fn test_foreign_document_has_no_owner() {
        assert_eq!(owner_from_snippet_name("clinic-faq"), None);
        assert_eq!(owner_from_snippet_name("call-context-not-a-uuid"), None);
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let a = content_fingerprint("A1C 9.7");
        let b = content_fingerprint("A1C 9.7");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_fingerprint("A1C 9.8"));
    }
}
