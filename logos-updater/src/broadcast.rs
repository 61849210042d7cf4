//! Pub/sub fan-out of updater events.
//!
//! Every applied update (and every rejected one, with its error) is published
//! on the `applied-ops` channel so connected clients can detect divergence.
//! Ranges edits go out on their own channels.
//!
//! Uses a tokio broadcast channel: O(1) publish to all subscribers, each
//! subscriber buffering up to `capacity` events before it starts lagging.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::update::Update;

pub const APPLIED_OPS_CHANNEL: &str = "applied-ops";
pub const ACCEPT_CHANGES_CHANNEL: &str = "accept-changes";
pub const DELETE_COMMENT_CHANNEL: &str = "delete-comment";

/// Event published by the updater. Serialises with its channel name as `channel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "kebab-case")]
pub enum UpdaterEvent {
    AppliedOps {
        project_id: Uuid,
        doc_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        op: Option<Update>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AcceptChanges {
        project_id: Uuid,
        doc_id: Uuid,
        change_ids: Vec<String>,
    },
    DeleteComment {
        project_id: Uuid,
        doc_id: Uuid,
        comment_id: String,
    },
}

impl UpdaterEvent {
    pub fn applied(project_id: Uuid, doc_id: Uuid, op: Update) -> Self {
        UpdaterEvent::AppliedOps {
            project_id,
            doc_id,
            op: Some(op),
            error: None,
        }
    }

    pub fn rejected(project_id: Uuid, doc_id: Uuid, error: impl ToString) -> Self {
        UpdaterEvent::AppliedOps {
            project_id,
            doc_id,
            op: None,
            error: Some(error.to_string()),
        }
    }

    pub fn channel(&self) -> &'static str {
        match self {
            UpdaterEvent::AppliedOps { .. } => APPLIED_OPS_CHANNEL,
            UpdaterEvent::AcceptChanges { .. } => ACCEPT_CHANGES_CHANNEL,
            UpdaterEvent::DeleteComment { .. } => DELETE_COMMENT_CHANNEL,
        }
    }

    pub fn doc_id(&self) -> Uuid {
        match self {
            UpdaterEvent::AppliedOps { doc_id, .. }
            | UpdaterEvent::AcceptChanges { doc_id, .. }
            | UpdaterEvent::DeleteComment { doc_id, .. } => *doc_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Statistics for monitoring publish health.
#[derive(Debug, Clone, Default)]
pub struct EventBusStats {
    pub published: u64,
    /// Events published while nobody was subscribed
    pub unobserved: u64,
    pub subscribers: usize,
}

/// Single channel shared by every publisher; lock-free on the hot path.
pub struct EventBus {
    sender: broadcast::Sender<Arc<UpdaterEvent>>,
    capacity: usize,
    published: AtomicU64,
    unobserved: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            published: AtomicU64::new(0),
            unobserved: AtomicU64::new(0),
        }
    }

    /// Publish to all current subscribers; returns how many received it.
    pub fn publish(&self, event: UpdaterEvent) -> usize {
        log::trace!("Publishing {} for doc {}", event.channel(), event.doc_id());
        self.published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(Arc::new(event)) {
            Ok(count) => count,
            Err(_) => {
                self.unobserved.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<UpdaterEvent>> {
        self.sender.subscribe()
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.published.load(Ordering::Relaxed),
            unobserved: self.unobserved.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Which connections have joined which document.
///
/// Rooms are created on first join and dropped when the last member leaves.
#[derive(Default)]
pub struct DocRooms {
    rooms: Arc<RwLock<HashMap<Uuid, HashSet<Uuid>>>>,
}

impl DocRooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a doc's room; returns the member count.
    pub async fn join(&self, doc_id: Uuid, conn_id: Uuid) -> usize {
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(doc_id).or_default();
        members.insert(conn_id);
        members.len()
    }

    /// Remove a connection; returns the members left (the room is dropped at 0).
    pub async fn leave(&self, doc_id: Uuid, conn_id: Uuid) -> usize {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(&doc_id) else {
            return 0;
        };
        members.remove(&conn_id);
        let left = members.len();
        if left == 0 {
            rooms.remove(&doc_id);
        }
        left
    }

    pub async fn is_member(&self, doc_id: Uuid, conn_id: Uuid) -> bool {
        self.rooms
            .read()
            .await
            .get(&doc_id)
            .is_some_and(|members| members.contains(&conn_id))
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::Component;

    #[tokio::test]
    async fn test_publish_fan_out() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());

        let update = Update::new(vec![Component::insert(0, "x")], 3);
        assert_eq!(bus.publish(UpdaterEvent::applied(p, d, update.clone())), 2);

        for rx in [&mut rx1, &mut rx2] {
            let event = rx.recv().await.unwrap();
            assert_eq!(*event, UpdaterEvent::applied(p, d, update.clone()));
        }
        assert_eq!(bus.stats().published, 1);
        assert_eq!(bus.stats().subscribers, 2);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(UpdaterEvent::rejected(Uuid::nil(), Uuid::nil(), "boom")), 0);
        assert_eq!(bus.stats().unobserved, 1);
    }

    #[test]
    fn test_event_json_shape() {
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
        let event = UpdaterEvent::rejected(p, d, "Delete component does not match");
        let json: serde_json::Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(json["channel"], APPLIED_OPS_CHANNEL);
        assert_eq!(json["error"], "Delete component does not match");
        assert_eq!(json["doc_id"], d.to_string());
        assert!(json.get("op").is_none());

        let accept = UpdaterEvent::AcceptChanges {
            project_id: p,
            doc_id: d,
            change_ids: vec!["c1".into()],
        };
        assert_eq!(accept.channel(), ACCEPT_CHANGES_CHANNEL);
        let json = serde_json::to_value(&accept).unwrap();
        assert_eq!(json["channel"], "accept-changes");
    }

    #[tokio::test]
    async fn test_rooms_join_leave() {
        let rooms = DocRooms::new();
        let doc = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(rooms.join(doc, a).await, 1);
        assert_eq!(rooms.join(doc, b).await, 2);
        assert!(rooms.is_member(doc, a).await);
        assert_eq!(rooms.leave(doc, a).await, 1);
        assert_eq!(rooms.room_count().await, 1);
        assert_eq!(rooms.leave(doc, b).await, 0);
        assert_eq!(rooms.room_count().await, 0);
        assert_eq!(rooms.leave(doc, b).await, 0);
    }
}
