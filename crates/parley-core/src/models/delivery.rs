use serde::{Deserialize, Serialize};

use crate::constants::fields;
use crate::remote::Fields;

/// Lifecycle stage of a message.
///
/// Forward path: `pending → sent → delivered → read`, skipping stages is
/// allowed (a recipient may read before we ever observe `delivered`).
/// `failed` branches off `pending`/`sent`; the only backward edge is
/// `failed → pending`, taken explicitly on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Sent => "sent",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Read => "read",
            DeliveryState::Failed => "failed",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryState::Pending),
            "sent" => Some(DeliveryState::Sent),
            "delivered" => Some(DeliveryState::Delivered),
            "read" => Some(DeliveryState::Read),
            "failed" => Some(DeliveryState::Failed),
            _ => None,
        }
    }

    /// Position on the forward path. `failed` is a side branch and has no
    /// rank; callers handle it explicitly.
    fn rank(&self) -> Option<u8> {
        match self {
            DeliveryState::Pending => Some(0),
            DeliveryState::Sent => Some(1),
            DeliveryState::Delivered => Some(2),
            DeliveryState::Read => Some(3),
            DeliveryState::Failed => None,
        }
    }

    /// Whether an explicit local transition from `self` to `next` is legal.
    pub fn can_transition_to(&self, next: DeliveryState) -> bool {
        match (self, next) {
            // Retry is the only way out of failed.
            (DeliveryState::Failed, DeliveryState::Pending) => true,
            (DeliveryState::Failed, _) => false,
            // Failure is only reachable before a peer has the message.
            (DeliveryState::Pending | DeliveryState::Sent, DeliveryState::Failed) => true,
            (_, DeliveryState::Failed) => false,
            // Forward-only on the main path.
            (current, next) => match (current.rank(), next.rank()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
        }
    }

    /// Merge a remote-observed state into the local one.
    ///
    /// Remote states are authoritative only when they are at or after the
    /// local state; a stale snapshot replaying an older state must not
    /// regress what the UI already shows.
    pub fn merge_remote(local: DeliveryState, remote: DeliveryState) -> DeliveryState {
        match (local.rank(), remote.rank()) {
            (Some(a), Some(b)) => {
                if b > a {
                    remote
                } else {
                    local
                }
            }
            // Local failed, but the remote store has the document at sent or
            // later: the write actually landed, adopt the remote view.
            (None, Some(b)) if b >= 1 => remote,
            // A remote `failed` (or remote pending against local failed)
            // never overrides what we know locally.
            _ => local,
        }
    }

    /// Map a remote document's delivery field to the canonical state.
    ///
    /// Fallback order, kept explicit for schema compatibility:
    /// 1. the canonical `deliveryState` field,
    /// 2. the legacy `status` spelling written by older clients,
    /// 3. the caller-supplied `fallback` when both are absent or carry an
    ///    unrecognized value.
    pub fn parse(doc_fields: &Fields, fallback: DeliveryState) -> DeliveryState {
        for key in [fields::DELIVERY_STATE, fields::LEGACY_DELIVERY_STATE] {
            if let Some(raw) = doc_fields.get(key).and_then(|v| v.as_str()) {
                if let Some(state) = Self::from_str_opt(raw) {
                    return state;
                }
                tracing::debug!(field = key, value = raw, "unrecognized delivery state");
            }
        }
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields_with(key: &str, value: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert(key.to_string(), json!(value));
        fields
    }

    #[test]
    fn test_forward_transitions() {
        use DeliveryState::*;
        assert!(Pending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Read));
        // Skipping stages is a legal subsequence.
        assert!(Pending.can_transition_to(Read));
        assert!(Sent.can_transition_to(Read));
    }

    #[test]
    fn test_no_backward_transitions() {
        use DeliveryState::*;
        assert!(!Sent.can_transition_to(Pending));
        assert!(!Delivered.can_transition_to(Sent));
        assert!(!Read.can_transition_to(Delivered));
        assert!(!Read.can_transition_to(Pending));
    }

    #[test]
    fn test_failed_edges() {
        use DeliveryState::*;
        assert!(Pending.can_transition_to(Failed));
        assert!(Sent.can_transition_to(Failed));
        assert!(!Delivered.can_transition_to(Failed));
        assert!(!Read.can_transition_to(Failed));
        // Retry is the only way out.
        assert!(Failed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Sent));
        assert!(!Failed.can_transition_to(Read));
    }

    #[test]
    fn test_merge_remote_never_regresses() {
        use DeliveryState::*;
        // Out-of-order: a delivered snapshot after a locally-applied read.
        assert_eq!(DeliveryState::merge_remote(Read, Delivered), Read);
        assert_eq!(DeliveryState::merge_remote(Delivered, Sent), Delivered);
        assert_eq!(DeliveryState::merge_remote(Sent, Read), Read);
        // Idempotent re-application.
        assert_eq!(DeliveryState::merge_remote(Sent, Sent), Sent);
    }

    #[test]
    fn test_merge_remote_failed_side_branch() {
        use DeliveryState::*;
        // The remote store saw the write land after we gave up locally.
        assert_eq!(DeliveryState::merge_remote(Failed, Sent), Sent);
        assert_eq!(DeliveryState::merge_remote(Failed, Read), Read);
        // A remote pending tells us nothing new about a failed message.
        assert_eq!(DeliveryState::merge_remote(Failed, Pending), Failed);
        // A stale remote failed never clobbers delivered progress.
        assert_eq!(DeliveryState::merge_remote(Delivered, Failed), Delivered);
    }

    #[test]
    fn test_parse_canonical_field() {
        let fields = fields_with("deliveryState", "delivered");
        assert_eq!(
            DeliveryState::parse(&fields, DeliveryState::Pending),
            DeliveryState::Delivered
        );
    }

    #[test]
    fn test_parse_legacy_field() {
        let fields = fields_with("status", "read");
        assert_eq!(
            DeliveryState::parse(&fields, DeliveryState::Pending),
            DeliveryState::Read
        );
    }

    #[test]
    fn test_parse_prefers_canonical_over_legacy() {
        let mut fields = fields_with("deliveryState", "sent");
        fields.insert("status".to_string(), json!("read"));
        assert_eq!(
            DeliveryState::parse(&fields, DeliveryState::Pending),
            DeliveryState::Sent
        );
    }

    #[test]
    fn test_parse_falls_back_on_unknown_or_missing() {
        let fields = fields_with("deliveryState", "teleported");
        assert_eq!(
            DeliveryState::parse(&fields, DeliveryState::Sent),
            DeliveryState::Sent
        );
        assert_eq!(
            DeliveryState::parse(&Fields::new(), DeliveryState::Pending),
            DeliveryState::Pending
        );
    }
}
