//! Tracks per-channel room settings announced by `ROOMSTATE`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::client::ChatClient;
use crate::connection::Connection;
use crate::event::{ConnectionEvent, EventBus, Subscription};
use crate::irc::Message;
use crate::mixin::{ClientMixin, ConnectionMixin};

/// Room settings. The server sends the full set on join and only the changed
/// fields afterwards, so every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomState {
    pub room_id: Option<String>,
    pub emote_only: Option<bool>,
    /// Minutes an account must follow before chatting; `-1` when disabled.
    pub followers_only: Option<i64>,
    pub r9k: Option<bool>,
    /// Seconds between messages per user.
    pub slow: Option<u64>,
    pub subs_only: Option<bool>,
}

impl RoomState {
    fn merge(&mut self, msg: &Message) {
        let flag = |key: &str| msg.tag(key).map(|v| v == "1");
        if let Some(id) = msg.tag("room-id") {
            self.room_id = Some(id.to_string());
        }
        if let Some(v) = flag("emote-only") {
            self.emote_only = Some(v);
        }
        if let Some(v) = msg.tag("followers-only").and_then(|v| v.parse().ok()) {
            self.followers_only = Some(v);
        }
        if let Some(v) = flag("r9k") {
            self.r9k = Some(v);
        }
        if let Some(v) = msg.tag("slow").and_then(|v| v.parse().ok()) {
            self.slow = Some(v);
        }
        if let Some(v) = flag("subs-only") {
            self.subs_only = Some(v);
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoomStateUpdate {
    pub channel: String,
    pub state: RoomState,
}

#[derive(Default)]
pub struct RoomStateTracker {
    states: RwLock<HashMap<String, RoomState>>,
    updates: EventBus<RoomStateUpdate>,
}

impl RoomStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_state(&self, channel: &str) -> Option<RoomState> {
        self.states.read().get(channel).cloned()
    }

    /// Merged state after every `ROOMSTATE`.
    pub fn subscribe(&self) -> Subscription<RoomStateUpdate> {
        self.updates.subscribe()
    }

    pub fn observe(&self, msg: &Message) {
        if msg.command != "ROOMSTATE" {
            return;
        }
        let Some(channel) = msg.channel() else {
            return;
        };
        let state = {
            let mut states = self.states.write();
            let state = states.entry(channel.to_string()).or_default();
            state.merge(msg);
            state.clone()
        };
        self.updates.publish(RoomStateUpdate {
            channel: channel.to_string(),
            state,
        });
    }
}

impl ClientMixin for RoomStateTracker {
    fn apply_to_client(self: Arc<Self>, client: &ChatClient) {
        client.set_room_state_tracker(Arc::clone(&self));
        client.add_connection_mixin(self);
    }
}

impl ConnectionMixin for RoomStateTracker {
    fn apply_to_connection(self: Arc<Self>, conn: &Arc<Connection>) {
        let mut events = conn.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let ConnectionEvent::Message(msg) = event {
                    self.observe(&msg);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_then_partial_update() {
        let tracker = RoomStateTracker::new();
        let mut updates = tracker.subscribe();

        tracker.observe(
            &Message::parse(
                "@emote-only=0;followers-only=-1;r9k=0;room-id=22484632;slow=0;subs-only=0 \
                 :tmi.twitch.tv ROOMSTATE #forsen",
            )
            .unwrap(),
        );
        tracker.observe(&Message::parse("@room-id=22484632;slow=10 :tmi.twitch.tv ROOMSTATE #forsen").unwrap());

        let state = tracker.channel_state("forsen").unwrap();
        assert_eq!(state.room_id.as_deref(), Some("22484632"));
        assert_eq!(state.slow, Some(10));
        assert_eq!(state.followers_only, Some(-1));
        assert_eq!(state.emote_only, Some(false));

        assert_eq!(updates.recv().await.unwrap().state.slow, Some(0));
        let second = updates.recv().await.unwrap();
        assert_eq!(second.channel, "forsen");
        assert_eq!(second.state.slow, Some(10));
    }

    #[test]
    fn ignores_other_commands() {
        let tracker = RoomStateTracker::new();
        tracker.observe(&Message::parse("@slow=5 :tmi.twitch.tv USERSTATE #forsen").unwrap());
        assert!(tracker.channel_state("forsen").is_none());
    }
}
