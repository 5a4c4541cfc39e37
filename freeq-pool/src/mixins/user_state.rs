//! Tracks our own user state: `GLOBALUSERSTATE` after login and
//! `USERSTATE` per channel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::client::ChatClient;
use crate::connection::Connection;
use crate::event::ConnectionEvent;
use crate::irc::Message;
use crate::mixin::{ClientMixin, ConnectionMixin};

/// Tags of the latest (GLOBAL)USERSTATE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserState {
    pub tags: HashMap<String, String>,
}

impl UserState {
    pub fn display_name(&self) -> Option<&str> {
        self.tag("display-name")
    }

    pub fn color(&self) -> Option<&str> {
        self.tag("color")
    }

    pub fn user_id(&self) -> Option<&str> {
        self.tag("user-id")
    }

    /// Badge names, e.g. `["moderator", "subscriber"]`.
    pub fn badges(&self) -> Vec<&str> {
        self.tag("badges")
            .map(|b| {
                b.split(',')
                    .filter_map(|badge| badge.split('/').next())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_mod(&self) -> bool {
        self.tag("mod") == Some("1")
    }

    fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .get(key)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Default)]
pub struct UserStateTracker {
    global: RwLock<Option<UserState>>,
    channels: RwLock<HashMap<String, UserState>>,
}

impl UserStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global_state(&self) -> Option<UserState> {
        self.global.read().clone()
    }

    pub fn channel_state(&self, channel: &str) -> Option<UserState> {
        self.channels.read().get(channel).cloned()
    }

    pub fn observe(&self, msg: &Message) {
        let state = UserState {
            tags: msg.tags.clone(),
        };
        match msg.command.as_str() {
            "GLOBALUSERSTATE" => *self.global.write() = Some(state),
            "USERSTATE" => {
                if let Some(channel) = msg.channel() {
                    self.channels.write().insert(channel.to_string(), state);
                }
            }
            _ => {}
        }
    }
}

impl ClientMixin for UserStateTracker {
    fn apply_to_client(self: Arc<Self>, client: &ChatClient) {
        client.set_user_state_tracker(Arc::clone(&self));
        client.add_connection_mixin(self);
    }
}

impl ConnectionMixin for UserStateTracker {
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
