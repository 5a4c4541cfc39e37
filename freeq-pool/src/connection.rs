//! One physical connection to the chat service.
//!
//! A [`Connection`] owns its wanted/joined channel sets and a background task
//! that performs login and pumps lines between the transport and its
//! [`EventBus`]. The client only reads the channel sets and calls the
//! connection's own operations (see `operations.rs`).

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::event::{ConnectionEvent, EventBus, Subscription};
use crate::irc::Message;
use crate::mixins::rate_limit::{ConnectGate, GatePermit};
use crate::transport::{Connector, EstablishedConnection};
use crate::validation::validate_raw_command;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// NOTICE texts the service sends when the login itself is refused.
const LOGIN_FAILURES: &[&str] = &[
    "Login authentication failed",
    "Improperly formatted auth",
    "Invalid NICK",
];

/// Process-unique connection identifier, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Connecting,
    Connected,
    Ready,
    Closed,
}

enum Outbound {
    Line(String),
    Shutdown,
}

struct State {
    lifecycle: Lifecycle,
    wanted: HashSet<String>,
    joined: HashSet<String>,
}

pub struct Connection {
    id: ConnectionId,
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    state: Mutex<State>,
    events: EventBus<ConnectionEvent>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    /// Taken by `connect`; `None` afterwards.
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    gates: Mutex<Vec<ConnectGate>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("lifecycle", &state.lifecycle)
            .field("wanted", &state.wanted.len())
            .field("joined", &state.joined.len())
            .finish()
    }
}

impl Connection {
    pub fn new(config: Arc<ClientConfig>, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            config,
            connector,
            state: Mutex::new(State {
                lifecycle: Lifecycle::Connecting,
                wanted: HashSet::new(),
                joined: HashSet::new(),
            }),
            events: EventBus::new(),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            gates: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle() == Lifecycle::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle() == Lifecycle::Closed
    }

    /// Channels this connection was asked to join.
    pub fn wanted_channels(&self) -> HashSet<String> {
        self.state.lock().wanted.clone()
    }

    /// Channels the server confirmed.
    pub fn joined_channels(&self) -> HashSet<String> {
        self.state.lock().joined.clone()
    }

    pub fn wanted_count(&self) -> usize {
        self.state.lock().wanted.len()
    }

    pub fn wants(&self, channel: &str) -> bool {
        self.state.lock().wanted.contains(channel)
    }

    pub fn has_joined(&self, channel: &str) -> bool {
        self.state.lock().joined.contains(channel)
    }

    pub fn subscribe(&self) -> Subscription<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Register a gate the connect sequence must pass before dialing.
    pub fn add_connect_gate(&self, gate: ConnectGate) {
        self.gates.lock().push(gate);
    }

    /// Whether `msg` was sent by this connection's own login.
    pub fn is_own(&self, msg: &Message) -> bool {
        msg.nick()
            .is_some_and(|nick| nick.eq_ignore_ascii_case(&self.config.username))
    }

    /// Add channels to the wanted set. Fails once the connection is closed.
    pub(crate) fn reserve_wanted(&self, channels: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Closed {
            return Err(Error::closed(self.id, None));
        }
        state.wanted.extend(channels.iter().cloned());
        Ok(())
    }

    /// Drop a channel from the wanted set. Also applies after close: until the
    /// client moves a closed connection's channels, this keeps one out.
    pub(crate) fn forget_wanted(&self, channel: &str) {
        self.state.lock().wanted.remove(channel);
    }

    /// Start the connect sequence in a background task. Calling it again is a
    /// no-op.
    pub fn connect(self: &Arc<Self>) {
        let Some(outbound) = self.outbound_rx.lock().take() else {
            return;
        };
        if !self.publish_live(ConnectionEvent::Connecting) {
            return;
        }
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let result = conn.run_session(outbound).await;
            if let Err(ref e) = result {
                tracing::debug!("Connection {} session ended: {e}", conn.id);
            }
            conn.finish(result.err());
        });
    }

    /// Queue one raw line. Lines are written in submission order once the
    /// login completed.
    pub fn send_raw(&self, command: &str) -> Result<()> {
        validate_raw_command(command)?;
        if self.is_closed() {
            return Err(Error::closed(self.id, None));
        }
        self.outbound_tx
            .send(Outbound::Line(command.to_string()))
            .map_err(|_| Error::closed(self.id, None))
    }

    /// Close without error.
    pub fn close(&self) {
        self.finish(None);
    }

    /// Close with `error`: subscribers see `Error(error)` then `Close(Some(error))`.
    pub fn destroy(&self, error: Error) {
        self.finish(Some(error));
    }

    /// Terminal transition; publishes `Close` exactly once.
    fn finish(&self, error: Option<Error>) {
        {
            let mut state = self.state.lock();
            if state.lifecycle == Lifecycle::Closed {
                return;
            }
            state.lifecycle = Lifecycle::Closed;
            if let Some(ref e) = error {
                self.events.publish(ConnectionEvent::Error(e.clone()));
            }
            self.events.close_with(ConnectionEvent::Close(error));
        }
        let _ = self.outbound_tx.send(Outbound::Shutdown);
    }

    /// Publish unless closed. Holding the state lock orders every event
    /// before the terminal `Close`.
    fn publish_live(&self, event: ConnectionEvent) -> bool {
        let state = self.state.lock();
        if state.lifecycle == Lifecycle::Closed {
            return false;
        }
        self.events.publish(event);
        true
    }

    fn transition(&self, to: Lifecycle, event: ConnectionEvent) -> bool {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Closed {
            return false;
        }
        state.lifecycle = to;
        self.events.publish(event);
        true
    }

    async fn run_session(&self, outbound: mpsc::UnboundedReceiver<Outbound>) -> Result<()> {
        let gates = self.gates.lock().clone();
        let mut permits = Vec::with_capacity(gates.len());
        for gate in gates {
            permits.push(gate.acquire().await);
        }
        if self.is_closed() {
            return Ok(());
        }

        let stream = self.connector.connect().await?;
        if !self.transition(Lifecycle::Connected, ConnectionEvent::Connect) {
            return Ok(());
        }
        tracing::debug!("Connection {} transport established", self.id);

        match stream {
            EstablishedConnection::Plain(tcp) => {
                let (reader, writer) = tokio::io::split(tcp);
                self.run_irc(BufReader::new(reader), writer, outbound, permits).await
            }
            EstablishedConnection::Tls(tls) => {
                let (reader, writer) = tokio::io::split(*tls);
                self.run_irc(BufReader::new(reader), writer, outbound, permits).await
            }
            EstablishedConnection::Duplex(duplex) => {
                let (reader, writer) = tokio::io::split(duplex);
                self.run_irc(BufReader::new(reader), writer, outbound, permits).await
            }
        }
    }

    async fn run_irc<R, W>(
        &self,
        reader: R,
        mut writer: W,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        mut permits: Vec<GatePermit>,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut caps = String::from("twitch.tv/commands twitch.tv/tags");
        if self.config.request_membership_capability {
            caps.push_str(" twitch.tv/membership");
        }
        self.write_line(&mut writer, &format!("CAP REQ :{caps}")).await?;
        if let Some(pass) = self.config.pass_token() {
            self.write_line(&mut writer, &format!("PASS {pass}")).await?;
        }
        self.write_line(&mut writer, &format!("NICK {}", self.config.username))
            .await?;

        let mut lines = reader.lines();
        let mut registered = false;
        // Lines queued before 001 are flushed in order once registered.
        let mut pending: Vec<String> = Vec::new();
        let mut last_activity = tokio::time::Instant::now();
        let ping_interval = self.config.ping_interval();
        let ping_timeout = self.config.ping_timeout();
        let mut ping_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "server closed the connection",
                        )
                        .into());
                    };
                    last_activity = tokio::time::Instant::now();
                    let Some(msg) = Message::parse(&line) else {
                        continue;
                    };
                    tracing::trace!("Connection {} < {}", self.id, line);

                    match msg.command.as_str() {
                        "PING" => {
                            let token = msg.param(0).unwrap_or("");
                            self.write_line(&mut writer, &format!("PONG :{token}")).await?;
                        }
                        "001" if !registered => {
                            registered = true;
                            // Free the connect slot for the next connection.
                            permits.clear();
                            for line in pending.drain(..) {
                                self.write_line(&mut writer, &line).await?;
                            }
                            if self.transition(Lifecycle::Ready, ConnectionEvent::Ready) {
                                tracing::info!("Connection {} ready", self.id);
                            }
                        }
                        "RECONNECT" => {
                            self.observe(msg);
                            return Err(Error::ReconnectRequested);
                        }
                        "NOTICE" if !registered => {
                            let text = msg.trailing().unwrap_or("").to_string();
                            if LOGIN_FAILURES.iter().any(|f| text.starts_with(f)) {
                                self.observe(msg);
                                return Err(Error::Login(text));
                            }
                        }
                        _ => {}
                    }
                    self.observe(msg);
                }
                cmd = outbound.recv() => match cmd {
                    Some(Outbound::Line(line)) if registered => {
                        self.write_line(&mut writer, &line).await?;
                    }
                    Some(Outbound::Line(line)) => pending.push(line),
                    Some(Outbound::Shutdown) | None => {
                        let _ = writer.shutdown().await;
                        return Ok(());
                    }
                },
                _ = ping_tick.tick() => {
                    if last_activity.elapsed() >= ping_timeout {
                        return Err(Error::PingTimeout);
                    }
                    if last_activity.elapsed() >= ping_interval {
                        self.write_line(&mut writer, "PING :tmi.twitch.tv").await?;
                    }
                }
            }
        }
    }

    /// Track own JOIN/PART, then publish the message.
    fn observe(&self, msg: Message) {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Closed {
            return;
        }
        if let Some(channel) = msg.channel().filter(|_| self.is_own(&msg)) {
            match msg.command.as_str() {
                "JOIN" => {
                    state.joined.insert(channel.to_string());
                }
                "PART" => {
                    state.joined.remove(channel);
                }
                _ => {}
            }
        }
        self.events.publish(ConnectionEvent::Message(Arc::new(msg)));
    }

    async fn write_line<W: AsyncWrite + Unpin>(&self, writer: &mut W, line: &str) -> Result<()> {
        writer.write_all(format!("{line}\r\n").as_bytes()).await?;
        writer.flush().await?;
        let shown = if line.starts_with("PASS ") {
            "PASS oauth:***".to_string()
        } else {
            line.to_string()
        };
        tracing::trace!("Connection {} > {}", self.id, shown);
        self.publish_live(ConnectionEvent::RawCommand(shown));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;

    fn test_connection() -> Arc<Connection> {
        let (connector, _peers) = MemoryConnector::new();
        Connection::new(Arc::new(ClientConfig::default()), Arc::new(connector))
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = test_connection();
        let b = test_connection();
        assert!(b.id() > a.id());
        assert_eq!(format!("{}", ConnectionId(4)), "#4");
    }

    #[test]
    fn starts_connecting_with_empty_sets() {
        let conn = test_connection();
        assert_eq!(conn.lifecycle(), Lifecycle::Connecting);
        assert!(conn.wanted_channels().is_empty());
        assert!(conn.joined_channels().is_empty());
    }

    #[tokio::test]
    async fn close_publishes_once_and_refuses_new_channels() {
        let conn = test_connection();
        conn.reserve_wanted(&["a".to_string(), "b".to_string()]).unwrap();
        let mut events = conn.subscribe();

        conn.close();
        conn.destroy(Error::PingTimeout);

        assert!(matches!(events.recv().await, Some(ConnectionEvent::Close(None))));
        assert!(events.recv().await.is_none());

        assert!(conn.reserve_wanted(&["c".to_string()]).is_err());
        assert_eq!(conn.wanted_count(), 2);
        conn.forget_wanted("a");
        assert_eq!(conn.wanted_channels(), HashSet::from(["b".to_string()]));
        assert!(conn.send_raw("PING").is_err());
    }

    #[tokio::test]
    async fn destroy_publishes_error_then_close() {
        let conn = test_connection();
        let mut events = conn.subscribe();
        conn.destroy(Error::Fatal("boom".into()));

        match events.recv().await {
            Some(ConnectionEvent::Error(Error::Fatal(m))) => assert_eq!(m, "boom"),
            other => panic!("expected error event, got {other:?}"),
        }
        let close = events.recv().await.unwrap();
        assert!(close.had_error());
    }

    #[test]
    fn send_raw_rejects_line_breaks() {
        let conn = test_connection();
        assert!(matches!(
            conn.send_raw("PRIVMSG #a :x\r\nQUIT"),
            Err(Error::InvalidRawCommand(_))
        ));
        conn.send_raw("PRIVMSG #a :x").unwrap();
    }

    #[test]
    fn own_messages_match_login_case_insensitively() {
        let conn = test_connection();
        let own = Message::parse(":JustinFan12345!justinfan12345@x JOIN #forsen").unwrap();
        let other = Message::parse(":someone!someone@x JOIN #forsen").unwrap();
        assert!(conn.is_own(&own));
        assert!(!conn.is_own(&other));
    }
}
