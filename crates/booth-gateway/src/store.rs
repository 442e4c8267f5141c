//! In-memory realtime store for call rooms.
//!
//! Each room is keyed by its access code and holds the host id, presence
//! records, one signaling mailbox per participant, the chat log and the last
//! activity time. Every mutation is published on the room's broadcast channel
//! as a [`RoomEvent`], which is how connections learn about added and removed
//! children.
//!
//! Lock order is room state first, then the room map. Nothing takes the map
//! lock and then a room's state lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use booth_common::{
    push_id, ChatMessage, Error, IceCandidate, PresenceRecord, Result, SessionDescription,
    SignalingMessage,
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;

const ROOM_EVENT_CAPACITY: usize = 256;
/// Chat entries kept per room.
const MAX_CHAT_HISTORY: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    UserAdded(PresenceRecord),
    UserRemoved {
        participant_id: String,
    },
    SignalAdded {
        to: String,
        message: SignalingMessage,
    },
    ChatAdded(ChatMessage),
    RoomDeleted,
}

/// Outcome of a host compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostClaim {
    Elected,
    Existing(String),
}

#[derive(Debug, Default)]
struct RoomState {
    host_id: Option<String>,
    users: BTreeMap<String, PresenceRecord>,
    signaling: HashMap<String, BTreeMap<String, SignalingMessage>>,
    chat: Vec<ChatMessage>,
    /// Unset until the first touch; a room without activity is never stale.
    last_activity: Option<i64>,
    deleted: bool,
}

impl RoomState {
    fn live(&self, code: &str) -> Result<()> {
        if self.deleted {
            return Err(Error::not_found(format!("room {code} was deleted")));
        }
        Ok(())
    }

    fn touch(&mut self, now_ms: i64) {
        self.last_activity = Some(self.last_activity.map_or(now_ms, |last| last.max(now_ms)));
    }

    fn idle_longer_than(&self, now_ms: i64, stale: Duration) -> bool {
        self.last_activity
            .is_some_and(|last| now_ms - last > stale.as_millis() as i64)
    }
}

pub struct Room {
    code: String,
    state: Mutex<RoomState>,
    events: broadcast::Sender<RoomEvent>,
}

impl Room {
    fn new(code: String, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            code,
            state: Mutex::new(RoomState::default()),
            events,
        }
    }

    fn publish(&self, event: RoomEvent) {
        // No receivers simply means nobody is listening yet.
        let _ = self.events.send(event);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
    pub code: String,
    pub host_id: Option<String>,
    pub users: Vec<PresenceRecord>,
    pub chat: Vec<ChatMessage>,
    pub last_activity: Option<i64>,
    pub pending_signals: usize,
}

fn snapshot_of(room: &Room, state: &RoomState) -> RoomSnapshot {
    RoomSnapshot {
        code: room.code.clone(),
        host_id: state.host_id.clone(),
        users: state.users.values().cloned().collect(),
        chat: state.chat.clone(),
        last_activity: state.last_activity,
        pending_signals: state.signaling.values().map(BTreeMap::len).sum(),
    }
}

#[derive(Clone)]
pub struct RoomStore {
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
    event_capacity: usize,
}

impl Default for RoomStore {
    fn default() -> Self {
        Self::with_event_capacity(ROOM_EVENT_CAPACITY)
    }
}

impl RoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose rooms buffer at most `capacity` events per subscriber.
    pub fn with_event_capacity(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            event_capacity: capacity.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }

    async fn existing(&self, code: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(code).cloned()
    }

    /// Fetch the room, creating it if absent. Only `touch` may create rooms.
    async fn room(&self, code: &str) -> Arc<Room> {
        if let Some(room) = self.existing(code).await {
            return room;
        }
        let mut guard = self.rooms.write().await;
        guard
            .entry(code.to_string())
            .or_insert_with(|| Arc::new(Room::new(code.to_string(), self.event_capacity)))
            .clone()
    }

    async fn existing_or_err(&self, code: &str) -> Result<Arc<Room>> {
        self.existing(code)
            .await
            .ok_or_else(|| Error::not_found(format!("room {code} does not exist")))
    }

    pub async fn snapshot(&self, code: &str) -> Option<RoomSnapshot> {
        let room = self.existing(code).await?;
        let state = room.state.lock().await;
        if state.deleted {
            return None;
        }
        Some(snapshot_of(&room, &state))
    }

    pub async fn subscribe(&self, code: &str) -> Option<broadcast::Receiver<RoomEvent>> {
        let room = self.existing(code).await?;
        let state = room.state.lock().await;
        if state.deleted {
            return None;
        }
        Some(room.events.subscribe())
    }

    /// Subscribe and read the current room under the same lock, so every
    /// later change arrives as an event and nothing is seen twice.
    pub async fn subscribe_with_snapshot(
        &self,
        code: &str,
    ) -> Option<(broadcast::Receiver<RoomEvent>, RoomSnapshot)> {
        let room = self.existing(code).await?;
        let state = room.state.lock().await;
        if state.deleted {
            return None;
        }
        let snapshot = snapshot_of(&room, &state);
        Some((room.events.subscribe(), snapshot))
    }

    pub async fn touch(&self, code: &str, now_ms: i64) -> Result<()> {
        let room = self.room(code).await;
        let mut state = room.state.lock().await;
        state.live(code)?;
        state.touch(now_ms);
        Ok(())
    }

    /// Record activity on a room that must already exist.
    pub async fn refresh(&self, code: &str, now_ms: i64) -> Result<()> {
        let room = self.existing_or_err(code).await?;
        let mut state = room.state.lock().await;
        state.live(code)?;
        state.touch(now_ms);
        Ok(())
    }

    /// Atomically set `hostId` to `candidate` if it is unset.
    ///
    /// Once set, the host id never changes for the lifetime of the room.
    pub async fn claim_host(&self, code: &str, candidate: &str) -> Result<HostClaim> {
        let room = self.existing_or_err(code).await?;
        let mut state = room.state.lock().await;
        state.live(code)?;
        match &state.host_id {
            Some(existing) => Ok(HostClaim::Existing(existing.clone())),
            None => {
                state.host_id = Some(candidate.to_string());
                Ok(HostClaim::Elected)
            }
        }
    }

    pub async fn put_presence(&self, code: &str, record: PresenceRecord, now_ms: i64) -> Result<()> {
        let room = self.existing_or_err(code).await?;
        let mut state = room.state.lock().await;
        state.live(code)?;
        state.touch(now_ms);
        state
            .users
            .insert(record.participant_id.clone(), record.clone());
        room.publish(RoomEvent::UserAdded(record));
        Ok(())
    }

    /// Remove a participant's presence and mailbox. Returns whether the
    /// participant was present.
    pub async fn remove_participant(&self, code: &str, participant_id: &str, now_ms: i64) -> bool {
        let Some(room) = self.existing(code).await else {
            return false;
        };
        let mut state = room.state.lock().await;
        if state.deleted {
            return false;
        }
        state.touch(now_ms);
        state.signaling.remove(participant_id);
        let removed = state.users.remove(participant_id).is_some();
        if removed {
            room.publish(RoomEvent::UserRemoved {
                participant_id: participant_id.to_string(),
            });
        }
        removed
    }

    pub async fn clear_mailbox(&self, code: &str, owner: &str) -> Result<usize> {
        let room = self.existing_or_err(code).await?;
        let mut state = room.state.lock().await;
        state.live(code)?;
        Ok(state
            .signaling
            .remove(owner)
            .map(|mailbox| mailbox.len())
            .unwrap_or(0))
    }

    /// Append a message to `to`'s mailbox and return the stored entry.
    pub async fn push_signal(
        &self,
        code: &str,
        from: &str,
        to: &str,
        sdp: Option<SessionDescription>,
        candidate: Option<IceCandidate>,
        now_ms: i64,
    ) -> Result<SignalingMessage> {
        let room = self.existing_or_err(code).await?;
        let mut state = room.state.lock().await;
        state.live(code)?;
        state.touch(now_ms);

        let message = SignalingMessage {
            from: from.to_string(),
            timestamp: now_ms,
            message_id: push_id(now_ms, &mut rand::thread_rng()),
            sdp,
            candidate,
        };
        state
            .signaling
            .entry(to.to_string())
            .or_default()
            .insert(message.message_id.clone(), message.clone());
        room.publish(RoomEvent::SignalAdded {
            to: to.to_string(),
            message: message.clone(),
        });
        Ok(message)
    }

    /// Delete a processed entry from `owner`'s mailbox.
    pub async fn consume_signal(&self, code: &str, owner: &str, message_id: &str) -> bool {
        let Some(room) = self.existing(code).await else {
            return false;
        };
        let mut state = room.state.lock().await;
        if state.deleted {
            return false;
        }
        let removed = match state.signaling.get_mut(owner) {
            Some(mailbox) => {
                let removed = mailbox.remove(message_id).is_some();
                if mailbox.is_empty() {
                    state.signaling.remove(owner);
                }
                removed
            }
            None => false,
        };
        removed
    }

    /// Entries still waiting in `owner`'s mailbox, oldest first.
    pub async fn pending_signals(&self, code: &str, owner: &str) -> Vec<SignalingMessage> {
        let Some(room) = self.existing(code).await else {
            return Vec::new();
        };
        let state = room.state.lock().await;
        state
            .signaling
            .get(owner)
            .map(|mailbox| mailbox.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn append_chat(&self, code: &str, message: ChatMessage) -> Result<()> {
        let room = self.existing_or_err(code).await?;
        let mut state = room.state.lock().await;
        state.live(code)?;
        state.touch(message.timestamp);
        state.chat.push(message.clone());
        if state.chat.len() > MAX_CHAT_HISTORY {
            let overflow = state.chat.len() - MAX_CHAT_HISTORY;
            state.chat.drain(..overflow);
        }
        room.publish(RoomEvent::ChatAdded(message));
        Ok(())
    }

    /// Delete the whole room. Returns whether a live room was removed.
    pub async fn remove_room(&self, code: &str) -> bool {
        let Some(room) = self.existing(code).await else {
            return false;
        };
        let mut state = room.state.lock().await;
        if state.deleted {
            return false;
        }
        self.delete_locked(&room, &mut state).await;
        true
    }

    /// Delete the room if its last activity is older than `stale`.
    pub async fn remove_if_stale(&self, code: &str, now_ms: i64, stale: Duration) -> bool {
        let Some(room) = self.existing(code).await else {
            return false;
        };
        let mut state = room.state.lock().await;
        if state.deleted || !state.idle_longer_than(now_ms, stale) {
            return false;
        }
        self.delete_locked(&room, &mut state).await;
        true
    }

    async fn delete_locked(&self, room: &Arc<Room>, state: &mut RoomState) {
        state.deleted = true;
        state.users.clear();
        state.signaling.clear();
        state.chat.clear();
        {
            let mut guard = self.rooms.write().await;
            if guard
                .get(&room.code)
                .is_some_and(|current| Arc::ptr_eq(current, room))
            {
                guard.remove(&room.code);
            }
        }
        room.publish(RoomEvent::RoomDeleted);
        debug!("room {} deleted", room.code);
    }

    /// Delete rooms nobody is present in that have been idle longer than `stale`.
    pub async fn reap_idle_rooms(&self, now_ms: i64, stale: Duration) -> Vec<String> {
        let candidates: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut reaped = Vec::new();
        for room in candidates {
            let mut state = room.state.lock().await;
            if state.deleted || !state.users.is_empty() || !state.idle_longer_than(now_ms, stale) {
                continue;
            }
            self.delete_locked(&room, &mut state).await;
            reaped.push(room.code.clone());
        }
        reaped
    }

    /// Drop mailbox entries nobody consumed within `ttl`. Returns how many were dropped.
    pub async fn purge_stale_signals(&self, now_ms: i64, ttl: Duration) -> usize {
        let cutoff = now_ms - ttl.as_millis() as i64;
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut purged = 0;
        for room in rooms {
            let mut state = room.state.lock().await;
            if state.deleted {
                continue;
            }
            for mailbox in state.signaling.values_mut() {
                let before = mailbox.len();
                mailbox.retain(|_, message| message.timestamp >= cutoff);
                purged += before - mailbox.len();
            }
            state.signaling.retain(|_, mailbox| !mailbox.is_empty());
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(id: &str, now: i64) -> PresenceRecord {
        PresenceRecord {
            participant_id: id.to_string(),
            display_name: format!("Customer ({id})"),
            joined_at: now,
            user_agent: "test".into(),
            connection_id: now,
        }
    }

    #[tokio::test]
    async fn test_concurrent_claims_elect_single_host() {
        let store = RoomStore::new();
        store.touch("ROOM01", 1).await.unwrap();
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("p{i:02}");
                (id.clone(), store.claim_host("ROOM01", &id).await.unwrap())
            }));
        }

        let mut winners = Vec::new();
        let mut observed = Vec::new();
        for handle in handles {
            let (id, claim) = handle.await.unwrap();
            match claim {
                HostClaim::Elected => winners.push(id),
                HostClaim::Existing(host) => observed.push(host),
            }
        }
        assert_eq!(winners.len(), 1);
        assert!(observed.iter().all(|host| host == &winners[0]));

        let snapshot = store.snapshot("ROOM01").await.unwrap();
        assert_eq!(snapshot.host_id.as_deref(), Some(winners[0].as_str()));
    }

    #[tokio::test]
    async fn test_host_never_changes() {
        let store = RoomStore::new();
        store.touch("ROOM01", 1).await.unwrap();
        assert_eq!(store.claim_host("ROOM01", "a").await.unwrap(), HostClaim::Elected);
        store.remove_participant("ROOM01", "a", 10).await;
        assert_eq!(
            store.claim_host("ROOM01", "b").await.unwrap(),
            HostClaim::Existing("a".into())
        );
    }

    #[tokio::test]
    async fn test_presence_events() {
        let store = RoomStore::new();
        store.touch("ROOM01", 1).await.unwrap();
        let mut events = store.subscribe("ROOM01").await.unwrap();

        store.put_presence("ROOM01", presence("a", 1), 1).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), RoomEvent::UserAdded(presence("a", 1)));

        assert!(store.remove_participant("ROOM01", "a", 2).await);
        assert_eq!(
            events.recv().await.unwrap(),
            RoomEvent::UserRemoved {
                participant_id: "a".into()
            }
        );
        assert!(!store.remove_participant("ROOM01", "a", 3).await);
    }

    #[tokio::test]
    async fn test_mailbox_push_and_consume() {
        let store = RoomStore::new();
        store.touch("ROOM01", 1).await.unwrap();
        let mut events = store.subscribe("ROOM01").await.unwrap();

        let sent = store
            .push_signal("ROOM01", "a", "b", Some(SessionDescription::offer("v=0")), None, 5)
            .await
            .unwrap();
        assert_eq!(sent.from, "a");
        assert_eq!(sent.timestamp, 5);

        match events.recv().await.unwrap() {
            RoomEvent::SignalAdded { to, message } => {
                assert_eq!(to, "b");
                assert_eq!(message, sent);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(store.pending_signals("ROOM01", "b").await, vec![sent.clone()]);
        assert!(store.consume_signal("ROOM01", "b", &sent.message_id).await);
        assert!(events.try_recv().is_err());
        assert!(!store.consume_signal("ROOM01", "b", &sent.message_id).await);
        assert!(store.pending_signals("ROOM01", "b").await.is_empty());
        assert_eq!(store.snapshot("ROOM01").await.unwrap().pending_signals, 0);
    }

    #[tokio::test]
    async fn test_only_owner_can_consume() {
        let store = RoomStore::new();
        store.touch("ROOM01", 1).await.unwrap();
        let sent = store
            .push_signal("ROOM01", "a", "b", Some(SessionDescription::offer("v=0")), None, 5)
            .await
            .unwrap();
        assert!(!store.consume_signal("ROOM01", "a", &sent.message_id).await);
        assert_eq!(store.pending_signals("ROOM01", "b").await.len(), 1);
    }

    #[tokio::test]
    async fn test_signal_to_missing_room_fails() {
        let store = RoomStore::new();
        let result = store
            .push_signal("NOROOM", "a", "b", None, None, 1)
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_room_notifies_and_blocks_writes() {
        let store = RoomStore::new();
        store.touch("ROOM01", 1).await.unwrap();
        store.put_presence("ROOM01", presence("a", 1), 1).await.unwrap();
        let mut events = store.subscribe("ROOM01").await.unwrap();
        let held = store.existing("ROOM01").await.unwrap();

        assert!(store.remove_room("ROOM01").await);
        assert_eq!(events.recv().await.unwrap(), RoomEvent::RoomDeleted);
        assert!(store.snapshot("ROOM01").await.is_none());
        assert!(held.state.lock().await.live("ROOM01").is_err());
        assert!(!store.remove_room("ROOM01").await);

        // Only a touch brings the room back; a later join starts there.
        assert!(matches!(
            store.claim_host("ROOM01", "b").await,
            Err(Error::NotFound(_))
        ));
        store.touch("ROOM01", 2).await.unwrap();
        assert_eq!(store.claim_host("ROOM01", "b").await.unwrap(), HostClaim::Elected);
    }

    #[tokio::test]
    async fn test_join_steps_fail_after_room_deleted() {
        let store = RoomStore::new();
        store.touch("ROOM01", 1_000).await.unwrap();
        assert!(store.remove_room("ROOM01").await);

        assert!(matches!(
            store.claim_host("ROOM01", "a").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.clear_mailbox("ROOM01", "a").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.put_presence("ROOM01", presence("a", 1_000), 1_000).await,
            Err(Error::NotFound(_))
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_deletion_mid_join_never_yields_two_hosts() {
        let store = RoomStore::new();
        let stale = Duration::from_secs(300);
        let now = 1_000_000;

        // A touches, then the room is closed before A claims the host.
        store.touch("ROOM01", now).await.unwrap();
        assert!(store.remove_room("ROOM01").await);
        assert!(store.claim_host("ROOM01", "a").await.is_err());

        // A retries from the touch and wins the fresh room.
        store.touch("ROOM01", now).await.unwrap();
        assert_eq!(store.claim_host("ROOM01", "a").await.unwrap(), HostClaim::Elected);

        // A joiner arriving in the same millisecond sees a live room.
        assert!(!store.remove_if_stale("ROOM01", now, stale).await);
        store.touch("ROOM01", now).await.unwrap();
        assert_eq!(
            store.claim_host("ROOM01", "c").await.unwrap(),
            HostClaim::Existing("a".into())
        );
        store.clear_mailbox("ROOM01", "c").await.unwrap();
        assert_eq!(
            store.snapshot("ROOM01").await.unwrap().host_id.as_deref(),
            Some("a")
        );
    }

    #[tokio::test]
    async fn test_refresh_does_not_recreate_room() {
        let store = RoomStore::new();
        store.touch("ROOM01", 1).await.unwrap();
        store.refresh("ROOM01", 50).await.unwrap();
        assert_eq!(store.snapshot("ROOM01").await.unwrap().last_activity, Some(50));

        assert!(store.remove_room("ROOM01").await);
        assert!(store.refresh("ROOM01", 60).await.is_err());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_room_without_activity_is_never_stale() {
        let store = RoomStore::new();
        let stale = Duration::from_secs(300);
        let room = store.room("ROOM01").await;
        assert_eq!(room.state.lock().await.last_activity, None);

        assert!(!store.remove_if_stale("ROOM01", 10_000_000, stale).await);
        assert!(store.reap_idle_rooms(10_000_000, stale).await.is_empty());
        assert!(store.snapshot("ROOM01").await.is_some());
    }

    #[tokio::test]
    async fn test_remove_if_stale() {
        let store = RoomStore::new();
        let stale = Duration::from_secs(300);
        store.touch("ROOM01", 1_000).await.unwrap();
        assert!(!store.remove_if_stale("ROOM01", 1_000 + 300_000, stale).await);
        assert!(store.remove_if_stale("ROOM01", 1_000 + 300_001, stale).await);
        assert!(store.snapshot("ROOM01").await.is_none());
    }

    #[tokio::test]
    async fn test_reap_idle_rooms_keeps_occupied_rooms() {
        let store = RoomStore::new();
        let stale = Duration::from_secs(300);
        store.touch("EMPTY1", 0).await.unwrap();
        store.touch("BUSY01", 0).await.unwrap();
        store.put_presence("BUSY01", presence("a", 0), 0).await.unwrap();

        let reaped = store.reap_idle_rooms(400_000, stale).await;
        assert_eq!(reaped, vec!["EMPTY1".to_string()]);
        assert!(store.snapshot("BUSY01").await.is_some());
    }

    #[tokio::test]
    async fn test_purge_stale_signals() {
        let store = RoomStore::new();
        store.touch("ROOM01", 0).await.unwrap();
        store.push_signal("ROOM01", "a", "b", None, None, 1_000).await.unwrap();
        let fresh = store
            .push_signal("ROOM01", "a", "b", None, None, 100_000)
            .await
            .unwrap();

        let purged = store
            .purge_stale_signals(130_000, Duration::from_secs(60))
            .await;
        assert_eq!(purged, 1);
        assert_eq!(store.pending_signals("ROOM01", "b").await, vec![fresh]);
    }

    #[tokio::test]
    async fn test_chat_history_is_bounded() {
        let store = RoomStore::new();
        store.touch("ROOM01", 0).await.unwrap();
        for i in 0..(MAX_CHAT_HISTORY + 5) {
            store
                .append_chat(
                    "ROOM01",
                    ChatMessage {
                        message_id: format!("m{i:04}"),
                        text: "hi".into(),
                        sender: "Customer".into(),
                        sender_id: "a".into(),
                        sender_type: booth_common::Role::Customer,
                        timestamp: i as i64,
                    },
                )
                .await
                .unwrap();
        }
        let chat = store.snapshot("ROOM01").await.unwrap().chat;
        assert_eq!(chat.len(), MAX_CHAT_HISTORY);
        assert_eq!(chat[0].message_id, "m0005");
    }
}
