use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::constants::{fields, DIRECT_ID_PREFIX};
use crate::error::ChatError;
use crate::models::Message;
use crate::remote::{DocumentSnapshot, Fields};

/// A conversation between two or more participants.
///
/// The last-message fields are denormalized from the newest message known
/// locally. Per-participant read state is a single interaction timestamp per
/// user rather than one receipt row per message; the derived unread count and
/// the stored counter are kept in agreement by the writers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Unique participant ids, kept in canonical sorted order.
    pub participant_ids: Vec<String>,
    pub is_group: bool,
    pub group_name: Option<String>,
    pub last_message: Option<String>,
    pub last_message_at: Option<i64>,
    pub last_sender_id: Option<String>,
    /// Participant id → cached unread counter.
    pub unread_count: BTreeMap<String, u32>,
    /// Participant id → unix-millisecond timestamp of their last interaction.
    pub last_interaction_at: BTreeMap<String, i64>,
}

impl Conversation {
    /// Deterministic id for a 1:1 conversation: the two participant ids in
    /// canonical sort order, so both sides derive the same id.
    pub fn direct_id(a: &str, b: &str) -> String {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        format!("{DIRECT_ID_PREFIX}{lo}:{hi}")
    }

    pub fn direct(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        let id = Self::direct_id(&a, &b);
        let mut participant_ids = vec![a, b];
        participant_ids.sort();
        participant_ids.dedup();
        Self {
            id,
            participant_ids,
            is_group: false,
            group_name: None,
            last_message: None,
            last_message_at: None,
            last_sender_id: None,
            unread_count: BTreeMap::new(),
            last_interaction_at: BTreeMap::new(),
        }
    }

    pub fn group(
        id: impl Into<String>,
        name: impl Into<String>,
        participants: Vec<String>,
    ) -> Self {
        let mut participant_ids = participants;
        participant_ids.sort();
        participant_ids.dedup();
        Self {
            id: id.into(),
            participant_ids,
            is_group: true,
            group_name: Some(name.into()),
            last_message: None,
            last_message_at: None,
            last_sender_id: None,
            unread_count: BTreeMap::new(),
            last_interaction_at: BTreeMap::new(),
        }
    }

    /// Parse a remote conversation document. Conversation documents are
    /// server-authoritative for every field here, so parsing is a plain read.
    pub fn from_snapshot(snapshot: &DocumentSnapshot) -> Result<Self, ChatError> {
        let mut participant_ids = snapshot
            .str_array_field(fields::PARTICIPANT_IDS)
            .ok_or_else(|| ChatError::invalid_remote("conversation missing participantIds"))?;
        participant_ids.sort();
        participant_ids.dedup();

        let mut unread_count = BTreeMap::new();
        if let Some(map) = snapshot.map_field(fields::UNREAD_COUNT) {
            for (user, value) in map {
                if let Some(n) = value.as_u64() {
                    unread_count.insert(user.clone(), n.min(u32::MAX as u64) as u32);
                }
            }
        }

        let mut last_interaction_at = BTreeMap::new();
        if let Some(map) = snapshot.map_field(fields::LAST_INTERACTION) {
            for (user, value) in map {
                if let Some(ts) = value.as_i64() {
                    last_interaction_at.insert(user.clone(), ts);
                }
            }
        }

        Ok(Self {
            id: snapshot.id.clone(),
            participant_ids,
            is_group: snapshot.bool_field(fields::IS_GROUP).unwrap_or(false),
            group_name: snapshot.str_field(fields::GROUP_NAME).map(str::to_string),
            last_message: snapshot.str_field(fields::LAST_MESSAGE).map(str::to_string),
            last_message_at: snapshot.i64_field(fields::LAST_MESSAGE_TIMESTAMP),
            last_sender_id: snapshot
                .str_field(fields::LAST_SENDER_ID)
                .map(str::to_string),
            unread_count,
            last_interaction_at,
        })
    }

    pub fn to_remote_fields(&self) -> Fields {
        let mut doc = Fields::new();
        doc.insert(fields::PARTICIPANT_IDS.into(), json!(self.participant_ids));
        doc.insert(fields::IS_GROUP.into(), json!(self.is_group));
        if let Some(name) = &self.group_name {
            doc.insert(fields::GROUP_NAME.into(), json!(name));
        }
        if let Some(last) = &self.last_message {
            doc.insert(fields::LAST_MESSAGE.into(), json!(last));
        }
        if let Some(at) = self.last_message_at {
            doc.insert(fields::LAST_MESSAGE_TIMESTAMP.into(), json!(at));
        }
        if let Some(sender) = &self.last_sender_id {
            doc.insert(fields::LAST_SENDER_ID.into(), json!(sender));
        }
        doc.insert(
            fields::UNREAD_COUNT.into(),
            json!(self
                .unread_count
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect::<serde_json::Map<_, _>>()),
        );
        doc.insert(
            fields::LAST_INTERACTION.into(),
            json!(self
                .last_interaction_at
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect::<serde_json::Map<_, _>>()),
        );
        doc
    }

    /// Participants other than `user`.
    pub fn others(&self, user: &str) -> Vec<String> {
        self.participant_ids
            .iter()
            .filter(|p| p.as_str() != user)
            .cloned()
            .collect()
    }

    /// Refresh the denormalized last-message fields if `message` is newer
    /// than what they currently reflect. Returns whether anything changed.
    pub fn apply_last_message(&mut self, message: &Message) -> bool {
        if self
            .last_message_at
            .is_some_and(|at| at > message.created_at)
        {
            return false;
        }
        self.last_message = Some(message.text.clone());
        self.last_message_at = Some(message.created_at);
        self.last_sender_id = Some(message.sender_id.clone());
        true
    }

    /// Whether `user` has seen anything in this conversation at or after
    /// `timestamp`. This is the conversation-level read derivation: a user
    /// whose interaction timestamp is at or past a message's timestamp is
    /// treated as having read it, even without a per-message receipt.
    pub fn has_seen(&self, user: &str, timestamp: i64) -> bool {
        self.last_interaction_at
            .get(user)
            .is_some_and(|&at| at >= timestamp)
    }
}
