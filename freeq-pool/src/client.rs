//! One logical chat client over a pool of capped connections.
//!
//! This is the main entry point. [`ChatClient`] picks (or opens) the
//! connection that runs each command, spreads channels so no connection wants
//! more than `max_channel_count_per_connection` of them, rejoins a closed
//! connection's channels elsewhere, and forwards each `WHISPER` once.
//!
//! ## Locking
//!
//! Pool membership and the whisper slot sit behind one mutex that is never
//! held across an `.await`. Every operation picks its connection and queues
//! its lines while holding it, then awaits the reply without it. Connection
//! events are handled by one task per connection.
//!
//! ## Reconnection
//!
//! A connection that closes while the client is open has its wanted channels
//! resubmitted at once, without backoff. Subscribers see
//! [`ClientEvent::Reconnect`] and may layer their own policy on top.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::event::{ClientEvent, ConnectionEvent, EventBus, Subscription};
use crate::mixin::{ClientMixin, ConnectionMixin, MixinRegistry};
use crate::mixins::{ConnectionRateLimiter, RoomStateTracker, UserStateTracker};
use crate::pool::{Pool, below_ceiling, not_in_channel, remaining_capacity};
use crate::transport::{Connector, TcpConnector};
use crate::validation::{channel_name, validate_color, validate_raw_command};

/// How often one slice of channels is retried on another connection after
/// the one picked for it closed.
const MAX_RESERVE_ATTEMPTS: usize = 3;

/// Outcome per channel of [`ChatClient::join_all`]; `None` means joined.
pub type JoinResults = HashMap<String, Option<Error>>;

/// Handle to the client. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    pool: Mutex<Pool>,
    mixins: Mutex<MixinRegistry>,
    events: EventBus<ClientEvent>,
    room_state: OnceCell<Arc<RoomStateTracker>>,
    user_state: OnceCell<Arc<UserStateTracker>>,
}

impl fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool = self.inner.pool.lock();
        f.debug_struct("ChatClient")
            .field("username", &self.inner.config.username)
            .field("connections", &pool.len())
            .field("closed", &pool.closed)
            .finish()
    }
}

impl ChatClient {
    /// Client connecting to `config.server_addr` over TCP (TLS when
    /// configured).
    pub fn new(config: ClientConfig) -> Result<Self> {
        let connector = TcpConnector::from_config(&config);
        Self::with_connector(config, Arc::new(connector))
    }

    /// Client whose connections dial through `connector`.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let install_defaults = config.install_default_mixins;
        let rate_limits = config.connection_rate_limits.clone();

        let client = Self {
            inner: Arc::new(ClientInner {
                config: Arc::new(config),
                connector,
                pool: Mutex::new(Pool::default()),
                mixins: Mutex::new(MixinRegistry::default()),
                events: EventBus::new(),
                room_state: OnceCell::new(),
                user_state: OnceCell::new(),
            }),
        };
        if install_defaults {
            client.use_mixin(Arc::new(UserStateTracker::new()));
            client.use_mixin(Arc::new(RoomStateTracker::new()));
            client.use_mixin(Arc::new(ConnectionRateLimiter::new(&rate_limits)));
        }
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> Subscription<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Live connections, in selection order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.pool.lock().connections().to_vec()
    }

    /// Union of every live connection's wanted channels.
    pub fn wanted_channels(&self) -> HashSet<String> {
        self.inner.pool.lock().wanted_channels()
    }

    /// Union of every live connection's joined channels.
    pub fn joined_channels(&self) -> HashSet<String> {
        self.inner.pool.lock().joined_channels()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.lock().closed
    }

    /// Present when the default mixins are installed.
    pub fn room_state(&self) -> Option<Arc<RoomStateTracker>> {
        self.inner.room_state.get().cloned()
    }

    /// Present when the default mixins are installed.
    pub fn user_state(&self) -> Option<Arc<UserStateTracker>> {
        self.inner.user_state.get().cloned()
    }

    pub fn use_mixin(&self, mixin: Arc<dyn ClientMixin>) {
        mixin.apply_to_client(self);
    }

    /// Apply `mixin` to every connection opened from now on.
    pub fn add_connection_mixin(&self, mixin: Arc<dyn ConnectionMixin>) {
        self.inner.mixins.lock().push(mixin);
    }

    pub(crate) fn set_room_state_tracker(&self, tracker: Arc<RoomStateTracker>) {
        let _ = self.inner.room_state.set(tracker);
    }

    pub(crate) fn set_user_state_tracker(&self, tracker: Arc<UserStateTracker>) {
        let _ = self.inner.user_state.set(tracker);
    }

    /// Open a connection if none exists and wait until one is ready.
    pub async fn connect(&self) -> Result<()> {
        let mut events = {
            let mut pool = self.inner.pool.lock();
            if pool.connections().iter().any(|c| c.is_ready()) {
                return Ok(());
            }
            let events = self.inner.events.subscribe();
            require_connection(&self.inner, &mut pool, |_| true)?;
            events
        };
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Ready => return Ok(()),
                ClientEvent::Close(cause) => return Err(cause.unwrap_or(Error::ClientClosed)),
                _ => {}
            }
        }
        Err(Error::ClientClosed)
    }

    /// Close every connection. Subscribers see `Close(None)`.
    pub fn close(&self) {
        shutdown(&self.inner, None, true);
    }

    /// Close with an optional error: subscribers see `Error(err)` then
    /// `Close(Some(err))`, and every connection is destroyed with `err`.
    pub fn destroy(&self, error: Option<Error>) {
        shutdown(&self.inner, error, true);
    }

    /// Send a raw line on any connection.
    pub fn send_raw(&self, command: &str) -> Result<()> {
        validate_raw_command(command)?;
        let conn = self.require_connection(|_| true)?;
        conn.send_raw(command)
    }

    /// Join a channel. Succeeds at once if a connection already wants it.
    pub async fn join(&self, channel: &str) -> Result<()> {
        let channel = channel_name(channel)?;
        let pending = {
            let mut pool = self.inner.pool.lock();
            start_join_all(&self.inner, &mut pool, vec![channel.clone()])?
        };
        match pending.await.remove(&channel).flatten() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Leave a channel. Succeeds at once if no connection wants it.
    pub async fn part(&self, channel: &str) -> Result<()> {
        let channel = channel_name(channel)?;
        let pending = {
            let mut pool = self.inner.pool.lock();
            if pool.closed {
                return Err(Error::ClientClosed);
            }
            let holder = pool.select(|c| c.wants(&channel));
            // Closed connections stay in the pool until their channels are
            // moved; forgetting the channel there keeps it from being rejoined.
            for conn in pool.connections() {
                conn.forget_wanted(&channel);
            }
            let Some(conn) = holder else {
                return Ok(());
            };
            conn.part(channel)
        };
        match pending.await {
            // The channel is left with the connection.
            Err(Error::ConnectionClosed { .. }) => Ok(()),
            other => other,
        }
    }

    /// Join many channels, spread over as few connections as the ceiling
    /// allows. Only an invalid name fails the whole call; everything else
    /// is reported per channel.
    pub async fn join_all<I>(&self, channels: I) -> Result<JoinResults>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let channels = channels
            .into_iter()
            .map(|c| channel_name(c.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let pending = {
            let mut pool = self.inner.pool.lock();
            start_join_all(&self.inner, &mut pool, channels)?
        };
        Ok(pending.await)
    }

    /// Send a chat message without waiting for the server.
    pub fn privmsg(&self, channel: &str, text: &str) -> Result<()> {
        let channel = channel_name(channel)?;
        validate_raw_command(text)?;
        let conn = self.require_connection(|_| true)?;
        conn.privmsg(&channel, text)
    }

    /// Send a chat message and wait for the server to accept it.
    pub async fn say(&self, channel: &str, text: &str) -> Result<()> {
        let channel = channel_name(channel)?;
        validate_raw_command(text)?;
        let conn = self.require_connection(not_in_channel(&channel))?;
        conn.say(channel, text).await
    }

    pub async fn me(&self, channel: &str, text: &str) -> Result<()> {
        let channel = channel_name(channel)?;
        validate_raw_command(text)?;
        let conn = self.require_connection(not_in_channel(&channel))?;
        conn.me(channel, text).await
    }

    pub async fn whisper(&self, user: &str, text: &str) -> Result<()> {
        let user = channel_name(user)?;
        validate_raw_command(text)?;
        let conn = self.require_connection(|_| true)?;
        conn.whisper(user, text).await
    }

    pub async fn timeout(
        &self,
        channel: &str,
        user: &str,
        length: Duration,
        reason: Option<&str>,
    ) -> Result<()> {
        let channel = channel_name(channel)?;
        let user = channel_name(user)?;
        if let Some(reason) = reason {
            validate_raw_command(reason)?;
        }
        let conn = self.require_connection(|_| true)?;
        conn.timeout(channel, &user, length, reason).await
    }

    pub async fn ban(&self, channel: &str, user: &str, reason: Option<&str>) -> Result<()> {
        let channel = channel_name(channel)?;
        let user = channel_name(user)?;
        if let Some(reason) = reason {
            validate_raw_command(reason)?;
        }
        let conn = self.require_connection(|_| true)?;
        conn.ban(channel, &user, reason).await
    }

    /// Change the chat color of the logged-in user, e.g. `#1E90FF` or `Blue`.
    pub async fn set_color(&self, color: &str) -> Result<()> {
        validate_color(color)?;
        let conn = self.require_connection(|_| true)?;
        conn.set_color(color).await
    }

    pub async fn get_mods(&self, channel: &str) -> Result<Vec<String>> {
        let channel = channel_name(channel)?;
        let conn = self.require_connection(|_| true)?;
        conn.mods(channel).await
    }

    pub async fn get_vips(&self, channel: &str) -> Result<Vec<String>> {
        let channel = channel_name(channel)?;
        let conn = self.require_connection(|_| true)?;
        conn.vips(channel).await
    }

    pub async fn ping(&self) -> Result<()> {
        let conn = self.require_connection(|_| true)?;
        conn.ping().await
    }

    fn require_connection<F>(&self, predicate: F) -> Result<Arc<Connection>>
    where
        F: Fn(&Connection) -> bool,
    {
        let mut pool = self.inner.pool.lock();
        require_connection(&self.inner, &mut pool, predicate)
    }
}

/// First live connection matching `predicate` (moved to the end of the
/// pool), or a new one. A new connection must satisfy `predicate`.
fn require_connection<F>(
    inner: &Arc<ClientInner>,
    pool: &mut Pool,
    predicate: F,
) -> Result<Arc<Connection>>
where
    F: Fn(&Connection) -> bool,
{
    if pool.closed {
        return Err(Error::ClientClosed);
    }
    if let Some(conn) = pool.select(&predicate) {
        return Ok(conn);
    }

    let conn = Connection::new(Arc::clone(&inner.config), Arc::clone(&inner.connector));
    debug_assert!(predicate(conn.as_ref()));

    let mixins = inner.mixins.lock().clone();
    tracing::debug!("Creating new connection ({}) with {} mixin(s)", conn.id(), mixins.len());
    mixins.apply_all(&conn);
    watch_connection(inner, &conn);
    conn.connect();
    pool.push(Arc::clone(&conn));
    Ok(conn)
}

/// Reserve every batch while `pool` is locked; the returned future awaits
/// them all.
fn start_join_all(
    inner: &Arc<ClientInner>,
    pool: &mut Pool,
    channels: Vec<String>,
) -> Result<impl Future<Output = JoinResults> + Send + use<>> {
    if pool.closed {
        return Err(Error::ClientClosed);
    }
    let ceiling = inner.config.max_channel_count_per_connection;

    let mut results = JoinResults::new();
    let mut seen = HashSet::new();
    let mut todo = Vec::new();
    for channel in channels {
        if !seen.insert(channel.clone()) {
            continue;
        }
        if pool.any_wants(&channel) {
            results.insert(channel, None);
        } else {
            todo.push(channel);
        }
    }

    let has_room = below_ceiling(ceiling);
    let batches = distribute_joins(inner, pool, &todo, ceiling, has_room, &mut results)?;

    Ok(async move {
        for outcome in futures::future::join_all(batches).await {
            results.extend(outcome);
        }
        results
    })
}

type JoinBatch = BoxFuture<'static, HashMap<String, Option<Error>>>;

/// Split `channels` over connections satisfying `has_room`. A connection
/// that closes between selection and reservation is skipped and the slice
/// goes to the next one.
fn distribute_joins<F>(
    inner: &Arc<ClientInner>,
    pool: &mut Pool,
    channels: &[String],
    ceiling: usize,
    has_room: F,
    results: &mut JoinResults,
) -> Result<Vec<JoinBatch>>
where
    F: Fn(&Connection) -> bool,
{
    let mut batches = Vec::new();
    let mut rest = channels;
    let mut attempts = 0;
    while !rest.is_empty() {
        let conn = require_connection(inner, pool, &has_room)?;
        let take = remaining_capacity(&conn, ceiling).min(rest.len());
        let (batch, tail) = rest.split_at(take);
        match conn.join_all(batch.to_vec()) {
            Ok(pending) => {
                tracing::debug!("Joining {} channel(s) on connection {}", batch.len(), conn.id());
                batches.push(pending.boxed());
                attempts = 0;
            }
            Err(e) if attempts < MAX_RESERVE_ATTEMPTS => {
                tracing::debug!("Connection {} closed before joining: {e}", conn.id());
                attempts += 1;
                continue;
            }
            Err(e) => {
                tracing::warn!("Giving up on {} channel(s): {e}", batch.len());
                results.extend(batch.iter().map(|c| (c.clone(), Some(e.clone()))));
                attempts = 0;
            }
        }
        rest = tail;
    }
    Ok(batches)
}

/// Terminal transition. `announce` is false when the error was already
/// forwarded from a connection.
fn shutdown(inner: &ClientInner, error: Option<Error>, announce: bool) {
    let connections = {
        let mut pool = inner.pool.lock();
        if pool.closed {
            return;
        }
        pool.closed = true;
        if let Some(ref e) = error {
            if announce {
                inner.events.publish(ClientEvent::Error(e.clone()));
            }
            tracing::warn!(error = %e, "Client closing due to error");
        } else {
            tracing::debug!("Client closing");
        }
        inner.events.close_with(ClientEvent::Close(error.clone()));
        pool.connections().to_vec()
    };

    for conn in connections {
        match error {
            Some(ref e) => conn.destroy(e.clone()),
            None => conn.close(),
        }
    }
}

/// Forward `conn`'s events to the client until it closes. The task holds
/// only a weak reference to the client; a dropped client closes the
/// connection.
fn watch_connection(inner: &Arc<ClientInner>, conn: &Arc<Connection>) {
    let mut events = conn.subscribe();
    let client = Arc::downgrade(inner);
    let conn = Arc::clone(conn);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = Weak::upgrade(&client) else {
                conn.close();
                return;
            };
            handle_connection_event(&inner, &conn, event);
        }
    });
}

fn handle_connection_event(inner: &Arc<ClientInner>, conn: &Arc<Connection>, event: ConnectionEvent) {
    match event {
        ConnectionEvent::Connecting => inner.events.publish(ClientEvent::Connecting),
        ConnectionEvent::Connect => inner.events.publish(ClientEvent::Connect),
        ConnectionEvent::Ready => inner.events.publish(ClientEvent::Ready),
        ConnectionEvent::RawCommand(line) => inner.events.publish(ClientEvent::RawCommand(line)),
        ConnectionEvent::Message(msg) => {
            let mut pool = inner.pool.lock();
            if msg.command == "WHISPER" && !pool.whisper.admit(conn.id()) {
                tracing::trace!(
                    holder = ?pool.whisper.holder(),
                    "Dropping duplicate whisper from connection {}",
                    conn.id()
                );
                return;
            }
            inner.events.publish(ClientEvent::Message(msg));
        }
        ConnectionEvent::Error(e) => {
            {
                let pool = inner.pool.lock();
                if pool.closed {
                    return;
                }
                inner.events.publish(ClientEvent::Error(e.clone()));
            }
            if e.is_client_fatal() {
                shutdown(inner, Some(e), false);
            }
        }
        ConnectionEvent::Close(cause) => {
            match cause {
                Some(ref e) => tracing::warn!("Connection {} was closed due to error: {e}", conn.id()),
                None => tracing::debug!("Connection {} closed normally", conn.id()),
            }
            reconnect_failed_connection(inner, conn);
        }
    }
}

/// Move a closed connection's channels elsewhere, or keep one idle
/// connection open if the pool emptied.
///
/// Removal and the wanted snapshot happen under one pool lock, so a
/// concurrent `part` either edits the closed connection first or finds the
/// channel on its new connection.
fn reconnect_failed_connection(inner: &Arc<ClientInner>, closed: &Connection) {
    let connection_id = closed.id();

    let pending = {
        let mut pool = inner.pool.lock();
        pool.remove(connection_id);
        pool.whisper.release(connection_id);
        if pool.closed {
            return;
        }
        let mut channels: Vec<String> = closed.wanted_channels().into_iter().collect();
        channels.sort();

        let pending = if channels.is_empty() {
            if pool.is_empty() {
                if let Err(e) = require_connection(inner, &mut pool, |_| true) {
                    tracing::warn!("Could not replace connection {connection_id}: {e}");
                }
            }
            None
        } else {
            match start_join_all(inner, &mut pool, channels) {
                Ok(pending) => Some(pending),
                Err(e) => {
                    tracing::warn!("Could not rejoin channels of connection {connection_id}: {e}");
                    None
                }
            }
        };
        inner.events.publish(ClientEvent::Reconnect { connection_id });
        pending
    };

    if let Some(pending) = pending {
        tokio::spawn(async move {
            for (channel, outcome) in pending.await {
                if let Some(e) = outcome {
                    tracing::warn!(%channel, error = %e, "Failed to rejoin after connection {connection_id} closed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;

    fn test_client(ceiling: usize) -> ChatClient {
        let config = ClientConfig {
            max_channel_count_per_connection: ceiling,
            install_default_mixins: false,
            ..ClientConfig::default()
        };
        let (connector, peers) = MemoryConnector::new();
        // Nobody answers: connections stay in their connect sequence.
        std::mem::forget(peers);
        ChatClient::with_connector(config, Arc::new(connector)).unwrap()
    }

    fn wanted_per_connection(client: &ChatClient) -> Vec<Vec<String>> {
        client
            .connections()
            .iter()
            .map(|c| {
                let mut wanted: Vec<String> = c.wanted_channels().into_iter().collect();
                wanted.sort();
                wanted
            })
            .collect()
    }

    #[tokio::test]
    async fn join_all_fills_connections_up_to_ceiling() {
        let client = test_client(2);
        let pending = {
            let mut pool = client.inner.pool.lock();
            let channels = ["a", "b", "c", "d", "e"].map(String::from).to_vec();
            start_join_all(&client.inner, &mut pool, channels).unwrap()
        };
        drop(pending);

        assert_eq!(
            wanted_per_connection(&client),
            vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]
        );
    }

    #[tokio::test]
    async fn join_all_tops_up_existing_connection_first() {
        let client = test_client(3);
        let first = {
            let mut pool = client.inner.pool.lock();
            start_join_all(&client.inner, &mut pool, vec!["a".to_string()]).unwrap()
        };
        let second = {
            let mut pool = client.inner.pool.lock();
            let channels = ["a", "b", "c", "d", "b"].map(String::from).to_vec();
            start_join_all(&client.inner, &mut pool, channels).unwrap()
        };
        drop((first, second));

        assert_eq!(
            wanted_per_connection(&client),
            vec![vec!["a", "b", "c"], vec!["d"]]
        );
    }

    #[tokio::test]
    async fn slice_moves_off_a_connection_closed_after_selection() {
        let client = test_client(2);
        let first = {
            let mut pool = client.inner.pool.lock();
            start_join_all(&client.inner, &mut pool, vec!["a".to_string()]).unwrap()
        };
        drop(first);
        let stale = Arc::clone(&client.connections()[0]);

        // The first candidate closes as soon as it is picked.
        let tripped = std::cell::Cell::new(false);
        let closes_once = |c: &Connection| {
            if !tripped.replace(true) {
                c.close();
            }
            c.wanted_count() < 2
        };
        let mut results = JoinResults::new();
        let batches = {
            let mut pool = client.inner.pool.lock();
            let channels = ["b", "c"].map(String::from);
            distribute_joins(&client.inner, &mut pool, &channels, 2, closes_once, &mut results)
                .unwrap()
        };

        assert!(stale.is_closed());
        assert_eq!(batches.len(), 1);
        assert!(results.is_empty());
        assert_eq!(
            wanted_per_connection(&client),
            vec![vec!["a"], vec!["b", "c"]]
        );
    }

    #[tokio::test]
    async fn empty_join_all_opens_nothing() {
        let client = test_client(2);
        let results = client.join_all(Vec::<String>::new()).await.unwrap();
        assert!(results.is_empty());
        assert!(client.connections().is_empty());
    }

    #[tokio::test]
    async fn invalid_name_fails_join_all_before_any_connection() {
        let client = test_client(2);
        let err = client.join_all(["forsen", "not a channel"]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidChannelName(_)));
        assert!(client.connections().is_empty());
    }

    #[tokio::test]
    async fn operations_after_close_fail() {
        let client = test_client(2);
        let mut events = client.subscribe();
        client.close();
        client.close();

        assert!(matches!(events.recv().await, Some(ClientEvent::Close(None))));
        assert!(events.recv().await.is_none());
        assert!(matches!(client.join("forsen").await, Err(Error::ClientClosed)));
        assert!(matches!(client.send_raw("PING"), Err(Error::ClientClosed)));
        assert!(client.connections().is_empty());
    }

    #[test]
    fn zero_ceiling_is_rejected() {
        let (connector, _peers) = MemoryConnector::new();
        let config = ClientConfig {
            max_channel_count_per_connection: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(
            ChatClient::with_connector(config, Arc::new(connector)),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn default_mixins_expose_trackers() {
        let (connector, _peers) = MemoryConnector::new();
        let client = ChatClient::with_connector(ClientConfig::default(), Arc::new(connector)).unwrap();
        assert!(client.room_state().is_some());
        assert!(client.user_state().is_some());
        assert_eq!(client.inner.mixins.lock().len(), 3);
    }
}
