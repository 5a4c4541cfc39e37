//! Minimal IRCv3 line parser.

use std::collections::HashMap;

/// One IRC protocol line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// IRCv3 message tags (unescaped).
    pub tags: HashMap<String, String>,
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    /// Parse a single line (trailing CR/LF is ignored). Returns `None` for
    /// blank or malformed input.
    pub fn parse(line: &str) -> Option<Message> {
        let mut rest = line.trim_end_matches(['\r', '\n']);
        let mut tags = HashMap::new();

        if let Some(stripped) = rest.strip_prefix('@') {
            let (raw_tags, after) = stripped.split_once(' ')?;
            for tag in raw_tags.split(';').filter(|t| !t.is_empty()) {
                match tag.split_once('=') {
                    Some((k, v)) => tags.insert(k.to_string(), unescape_tag(v)),
                    None => tags.insert(tag.to_string(), String::new()),
                };
            }
            rest = after.trim_start_matches(' ');
        }

        let mut prefix = None;
        if let Some(stripped) = rest.strip_prefix(':') {
            let (p, after) = stripped.split_once(' ')?;
            prefix = Some(p.to_string());
            rest = after.trim_start_matches(' ');
        }

        let (command, mut rest) = match rest.split_once(' ') {
            Some((c, after)) => (c, after),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((p, after)) => {
                    params.push(p.to_string());
                    rest = after;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Message {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Nick part of the prefix (`nick!user@host`).
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        let nick = prefix.split('!').next().unwrap_or(prefix);
        (!nick.is_empty()).then_some(nick)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|s| s.as_str())
    }

    pub fn param(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(|s| s.as_str())
    }

    /// Channel name of the first parameter without its `#`, if it is one.
    pub fn channel(&self) -> Option<&str> {
        self.param(0)?.strip_prefix('#')
    }

    /// Last parameter, conventionally the free-text body.
    pub fn trailing(&self) -> Option<&str> {
        self.params.last().map(|s| s.as_str())
    }
}

fn unescape_tag(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    let mut chars = v.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_privmsg_with_tags() {
        let msg = Message::parse(
            "@badge-info=;color=#0000FF;display-name=Bob;msg-id=highlighted-message \
             :bob!bob@bob.tmi.twitch.tv PRIVMSG #forsen :hello there\r\n",
        )
        .unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.nick(), Some("bob"));
        assert_eq!(msg.channel(), Some("forsen"));
        assert_eq!(msg.trailing(), Some("hello there"));
        assert_eq!(msg.tag("display-name"), Some("Bob"));
        assert_eq!(msg.tag("badge-info"), Some(""));
    }

    #[test]
    fn parse_without_prefix_or_trailing() {
        let msg = Message::parse("PING tmi.twitch.tv").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["tmi.twitch.tv"]);
        assert!(msg.prefix.is_none());
        assert_eq!(msg.nick(), None);
    }

    #[test]
    fn parse_unescapes_tag_values() {
        let msg = Message::parse("@system-msg=a\\sb\\:c\\\\d :tmi.twitch.tv USERNOTICE #x").unwrap();
        assert_eq!(msg.tag("system-msg"), Some("a b;c\\d"));
    }

    #[test]
    fn parse_rejects_blank_lines() {
        assert!(Message::parse("").is_none());
        assert!(Message::parse("\r\n").is_none());
        assert!(Message::parse(":prefix-only").is_none());
    }
}
