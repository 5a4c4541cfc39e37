//! Commands a single [`Connection`] executes, and how each one's outcome is
//! read back from the server.
//!
//! Every operation does its bookkeeping and queues its line synchronously,
//! then returns a future that resolves from the connection's event stream.
//! The subscription is taken before the line is queued, so no reply can be
//! missed. The response timeout only starts once the connection is ready.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::connection::{Connection, ConnectionId};
use crate::error::{Error, Result};
use crate::event::{ConnectionEvent, Subscription};
use crate::irc::Message;

/// NOTICE ids that mean a JOIN will never succeed.
const JOIN_FAILURES: &[&str] = &[
    "msg_channel_suspended",
    "msg_channel_blocked",
    "msg_banned",
    "msg_room_not_found",
    "tos_ban",
    "invalid_user",
];

/// Longest line we send, excluding CRLF.
const MAX_LINE_LEN: usize = 510;

/// Replies to one request, read from a subscription taken before sending.
struct Responses {
    connection_id: ConnectionId,
    events: Subscription<ConnectionEvent>,
    ready: bool,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl Responses {
    /// Next inbound message; `Ok(None)` once the timeout elapsed.
    async fn next(&mut self) -> Result<Option<Arc<Message>>> {
        loop {
            let event = if self.ready {
                let deadline = *self
                    .deadline
                    .get_or_insert_with(|| Instant::now() + self.timeout);
                match tokio::time::timeout_at(deadline, self.events.recv()).await {
                    Ok(event) => event,
                    Err(_) => return Ok(None),
                }
            } else {
                self.events.recv().await
            };

            match event {
                None => return Err(Error::closed(self.connection_id, None)),
                Some(ConnectionEvent::Close(cause)) => {
                    return Err(Error::closed(self.connection_id, cause));
                }
                Some(ConnectionEvent::Ready) => self.ready = true,
                Some(ConnectionEvent::Message(msg)) if self.ready => return Ok(Some(msg)),
                Some(_) => {}
            }
        }
    }
}

impl Connection {
    fn listen(&self) -> Responses {
        let events = self.subscribe();
        Responses {
            connection_id: self.id(),
            events,
            ready: self.is_ready(),
            timeout: self.config().request_timeout(),
            deadline: None,
        }
    }

    /// Subscribe, then queue `line`.
    fn request(&self, line: &str) -> Result<Responses> {
        let responses = self.listen();
        self.send_raw(line)?;
        Ok(responses)
    }

    /// Join several channels in one batch. Every channel maps to `None` on
    /// success or to the reason it failed. Channels that fail (other than by
    /// the connection closing) are dropped from the wanted set.
    ///
    /// Fails without side effects when the connection already closed, so the
    /// caller can pick another one.
    pub fn join_all(
        self: &Arc<Self>,
        channels: Vec<String>,
    ) -> Result<impl Future<Output = HashMap<String, Option<Error>>> + Send + use<>> {
        self.reserve_wanted(&channels)?;
        let responses = self.listen();
        let sent = join_lines(&channels)
            .iter()
            .try_for_each(|line| self.send_raw(line));
        Ok(collect_joins(
            Arc::clone(self),
            channels,
            sent.map(|()| responses),
        ))
    }

    fn join_outcome(&self, msg: &Message) -> Option<(String, Result<()>)> {
        let channel = msg.channel()?;
        match msg.command.as_str() {
            "JOIN" if self.is_own(msg) => Some((channel.to_string(), Ok(()))),
            "NOTICE" => {
                let id = msg.tag("msg-id")?;
                JOIN_FAILURES.contains(&id).then(|| {
                    let err = Error::Rejected {
                        command: "JOIN",
                        target: channel.to_string(),
                        reason: id.to_string(),
                    };
                    (channel.to_string(), Err(err))
                })
            }
            _ => None,
        }
    }

    /// Leave a channel; resolves when the server echoes our PART.
    pub fn part(
        self: &Arc<Self>,
        channel: String,
    ) -> impl Future<Output = Result<()>> + Send + use<> {
        self.forget_wanted(&channel);
        let conn = Arc::clone(self);
        let started = self.request(&format!("PART #{channel}"));

        async move {
            let mut responses = started?;
            while let Some(msg) = responses.next().await? {
                if msg.command == "PART"
                    && msg.channel() == Some(channel.as_str())
                    && conn.is_own(&msg)
                {
                    return Ok(());
                }
            }
            Err(Error::Timeout {
                command: "PART",
                target: channel,
            })
        }
    }

    /// Send a PRIVMSG without waiting for anything.
    pub fn privmsg(&self, channel: &str, text: &str) -> Result<()> {
        self.send_raw(&format!("PRIVMSG #{channel} :{text}"))
    }

    /// Send a chat message; resolves on the server's USERSTATE for the channel.
    pub fn say(
        self: &Arc<Self>,
        channel: String,
        text: &str,
    ) -> impl Future<Output = Result<()>> + Send + use<> {
        let started = self.request(&format!("PRIVMSG #{channel} :{text}"));

        async move {
            let mut responses = started?;
            while let Some(msg) = responses.next().await? {
                if msg.channel() != Some(channel.as_str()) {
                    continue;
                }
                match msg.command.as_str() {
                    "USERSTATE" => return Ok(()),
                    "NOTICE" => {
                        if let Some(id) = msg.tag("msg-id").filter(|id| id.starts_with("msg_")) {
                            return Err(Error::Rejected {
                                command: "PRIVMSG",
                                target: channel,
                                reason: id.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            Err(Error::Timeout {
                command: "PRIVMSG",
                target: channel,
            })
        }
    }

    /// `/me` action message.
    pub fn me(
        self: &Arc<Self>,
        channel: String,
        text: &str,
    ) -> impl Future<Output = Result<()>> + Send + use<> {
        self.say(channel, &format!("/me {text}"))
    }

    /// Send a direct message. The service only answers failures, so silence
    /// until the timeout counts as delivered.
    pub fn whisper(
        self: &Arc<Self>,
        user: String,
        text: &str,
    ) -> impl Future<Output = Result<()>> + Send + use<> {
        let own = self.config().nick();
        let started = self.request(&format!("PRIVMSG #{own} :/w {user} {text}"));

        async move {
            let mut responses = started?;
            while let Some(msg) = responses.next().await? {
                if msg.command != "NOTICE" {
                    continue;
                }
                if let Some(id) = msg.tag("msg-id").filter(|id| id.starts_with("whisper_")) {
                    return Err(Error::Rejected {
                        command: "WHISPER",
                        target: user,
                        reason: id.to_string(),
                    });
                }
            }
            Ok(())
        }
    }

    /// Time a user out in a channel.
    pub fn timeout(
        self: &Arc<Self>,
        channel: String,
        user: &str,
        length: Duration,
        reason: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send + use<> {
        let mut command = format!("/timeout {user} {}", length.as_secs().max(1));
        if let Some(reason) = reason {
            command.push(' ');
            command.push_str(reason);
        }
        self.moderate(channel, &command, "timeout_success")
    }

    /// Ban a user from a channel.
    pub fn ban(
        self: &Arc<Self>,
        channel: String,
        user: &str,
        reason: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send + use<> {
        let mut command = format!("/ban {user}");
        if let Some(reason) = reason {
            command.push(' ');
            command.push_str(reason);
        }
        self.moderate(channel, &command, "ban_success")
    }

    /// Moderation commands are answered by a NOTICE in the channel: the
    /// `success` id, or any other id for a refusal.
    fn moderate(
        self: &Arc<Self>,
        channel: String,
        command: &str,
        success: &'static str,
    ) -> impl Future<Output = Result<()>> + Send + use<> {
        let started = self.request(&format!("PRIVMSG #{channel} :{command}"));

        async move {
            let notice = channel_notice(started?, &channel).await?;
            if notice.tag("msg-id") == Some(success) {
                Ok(())
            } else {
                Err(refused(channel, &notice))
            }
        }
    }

    /// Change the chat color of the logged-in user.
    pub fn set_color(
        self: &Arc<Self>,
        color: &str,
    ) -> impl Future<Output = Result<()>> + Send + use<> {
        let own = self.config().nick();
        self.moderate(own, &format!("/color {color}"), "color_changed")
    }

    /// Moderators of a channel.
    pub fn mods(
        self: &Arc<Self>,
        channel: String,
    ) -> impl Future<Output = Result<Vec<String>>> + Send + use<> {
        self.list_users(channel, "/mods", "room_mods", "no_mods")
    }

    /// VIPs of a channel.
    pub fn vips(
        self: &Arc<Self>,
        channel: String,
    ) -> impl Future<Output = Result<Vec<String>>> + Send + use<> {
        self.list_users(channel, "/vips", "vips_success", "no_vips")
    }

    fn list_users(
        self: &Arc<Self>,
        channel: String,
        command: &str,
        listed: &'static str,
        none: &'static str,
    ) -> impl Future<Output = Result<Vec<String>>> + Send + use<> {
        let started = self.request(&format!("PRIVMSG #{channel} :{command}"));

        async move {
            let notice = channel_notice(started?, &channel).await?;
            match notice.tag("msg-id") {
                Some(id) if id == listed => Ok(parse_user_list(notice.trailing().unwrap_or(""))),
                Some(id) if id == none => Ok(Vec::new()),
                _ => Err(refused(channel, &notice)),
            }
        }
    }

    /// Round-trip a PING with a random token.
    pub fn ping(self: &Arc<Self>) -> impl Future<Output = Result<()>> + Send + use<> {
        let token = format!("freeq-pool-{}", rand::thread_rng().r#gen::<u32>());
        let started = self.request(&format!("PING :{token}"));

        async move {
            let mut responses = started?;
            while let Some(msg) = responses.next().await? {
                if msg.command == "PONG" && msg.trailing() == Some(token.as_str()) {
                    return Ok(());
                }
            }
            Err(Error::Timeout {
                command: "PING",
                target: token,
            })
        }
    }
}

/// Resolve a JOIN batch from the server's echoes and failure notices.
async fn collect_joins(
    conn: Arc<Connection>,
    channels: Vec<String>,
    started: Result<Responses>,
) -> HashMap<String, Option<Error>> {
    let mut results = HashMap::with_capacity(channels.len());
    let mut responses = match started {
        Ok(responses) => responses,
        Err(e) => {
            return channels.into_iter().map(|c| (c, Some(e.clone()))).collect();
        }
    };
    let mut pending: HashSet<String> = channels.into_iter().collect();

    while !pending.is_empty() {
        match responses.next().await {
            Ok(Some(msg)) => {
                let Some((channel, outcome)) = conn.join_outcome(&msg) else {
                    continue;
                };
                if !pending.remove(&channel) {
                    continue;
                }
                if outcome.is_err() {
                    conn.forget_wanted(&channel);
                }
                results.insert(channel, outcome.err());
            }
            Ok(None) => {
                for channel in pending.drain() {
                    conn.forget_wanted(&channel);
                    let err = Error::Timeout {
                        command: "JOIN",
                        target: channel.clone(),
                    };
                    results.insert(channel, Some(err));
                }
            }
            Err(e) => {
                for channel in pending.drain() {
                    results.insert(channel, Some(e.clone()));
                }
            }
        }
    }
    results
}

/// First NOTICE in `channel` carrying a `msg-id`.
async fn channel_notice(mut responses: Responses, channel: &str) -> Result<Arc<Message>> {
    while let Some(msg) = responses.next().await? {
        if msg.command == "NOTICE"
            && msg.channel() == Some(channel)
            && msg.tag("msg-id").is_some()
        {
            return Ok(msg);
        }
    }
    Err(Error::Timeout {
        command: "PRIVMSG",
        target: channel.to_string(),
    })
}

fn refused(channel: String, notice: &Message) -> Error {
    Error::Rejected {
        command: "PRIVMSG",
        target: channel,
        reason: notice.tag("msg-id").unwrap_or_default().to_string(),
    }
}

/// Logins listed after the colon of a `/mods` or `/vips` reply.
fn parse_user_list(text: &str) -> Vec<String> {
    let Some((_, list)) = text.split_once(": ") else {
        return Vec::new();
    };
    list.trim_end_matches('.')
        .split(',')
        .map(str::trim)
        .filter(|login| !login.is_empty())
        .map(str::to_string)
        .collect()
}

/// `JOIN #a,#b,...` lines, each within the IRC line limit.
pub(crate) fn join_lines(channels: &[String]) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for channel in channels {
        let extra = channel.len() + 1 + usize::from(!current.is_empty());
        if !current.is_empty() && "JOIN ".len() + current.len() + extra > MAX_LINE_LEN {
            lines.push(format!("JOIN {current}"));
            current.clear();
        }
        if !current.is_empty() {
            current.push(',');
        }
        current.push('#');
        current.push_str(channel);
    }
    if !current.is_empty() {
        lines.push(format!("JOIN {current}"));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_lists_are_split_after_the_colon() {
        assert_eq!(
            parse_user_list("The moderators of this channel are: forsen, pajbot, nightbot"),
            vec!["forsen", "pajbot", "nightbot"]
        );
        assert_eq!(parse_user_list("The VIPs of this channel are: a_vip, b_vip."), vec!["a_vip", "b_vip"]);
        assert!(parse_user_list("There are no moderators of this channel.").is_empty());
    }

    #[test]
    fn join_lines_batches_channels() {
        let channels = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(join_lines(&channels), vec!["JOIN #a,#b,#c"]);
        assert!(join_lines(&[]).is_empty());
    }

    #[test]
    fn join_lines_respect_line_limit() {
        let channels: Vec<String> = (0..100).map(|i| format!("channel_{i:05}")).collect();
        let lines = join_lines(&channels);
        assert!(lines.len() > 1);
        for line in &lines {
            assert!(line.len() <= MAX_LINE_LEN, "{} bytes", line.len());
        }
        let rejoined: Vec<&str> = lines
            .iter()
            .flat_map(|l| l.trim_start_matches("JOIN ").split(','))
            .collect();
        assert_eq!(rejoined.len(), 100);
        assert_eq!(rejoined[0], "#channel_00000");
        assert_eq!(rejoined[99], "#channel_00099");
    }
}
