//! Channel-name normalisation and input checks.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

static CHANNEL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_]{1,25}$").expect("static regex"));

/// `#RRGGBB`, or a named color such as `Blue` or `SpringGreen`.
static CHAT_COLOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(#[0-9A-Fa-f]{6}|[A-Za-z]+)$").expect("static regex"));

/// Normalise a user-supplied channel name: trim, drop one leading `#`, lowercase.
pub fn correct_channel_name(name: &str) -> String {
    let name = name.trim();
    name.strip_prefix('#').unwrap_or(name).to_lowercase()
}

/// Check an already-normalised channel (or user) name.
pub fn validate_channel_name(name: &str) -> Result<()> {
    if CHANNEL_NAME.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidChannelName(name.to_string()))
    }
}

/// Normalise then validate.
pub fn channel_name(name: &str) -> Result<String> {
    let name = correct_channel_name(name);
    validate_channel_name(&name)?;
    Ok(name)
}

/// Raw commands are written as one line; embedded line breaks would smuggle
/// extra commands onto the wire.
pub fn validate_raw_command(command: &str) -> Result<()> {
    if command.contains(['\r', '\n']) {
        return Err(Error::InvalidRawCommand(command.to_string()));
    }
    Ok(())
}

pub fn validate_color(color: &str) -> Result<()> {
    if CHAT_COLOR.is_match(color) {
        Ok(())
    } else {
        Err(Error::InvalidColor(color.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrects_case_and_hash() {
        assert_eq!(correct_channel_name("#Forsen"), "forsen");
        assert_eq!(correct_channel_name("  pajlada "), "pajlada");
        assert_eq!(correct_channel_name("##double"), "#double");
    }

    #[test]
    fn accepts_twitch_logins() {
        for name in ["a", "forsen", "some_user_123", "x".repeat(25).as_str()] {
            assert!(validate_channel_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_malformed_names() {
        for name in ["", "#double", "has space", "UPPER", "dash-ed", "x".repeat(26).as_str()] {
            assert!(
                matches!(validate_channel_name(name), Err(Error::InvalidChannelName(_))),
                "{name:?}"
            );
        }
    }

    #[test]
    fn channel_name_combines_both() {
        assert_eq!(channel_name("#Pajlada").unwrap(), "pajlada");
        assert!(channel_name("#").is_err());
    }

    #[test]
    fn colors() {
        for color in ["#1E90FF", "#00ff7f", "Blue", "SpringGreen"] {
            assert!(validate_color(color).is_ok(), "{color}");
        }
        for color in ["", "#12345", "1E90FF", "light blue", "#GGGGGG"] {
            assert!(matches!(validate_color(color), Err(Error::InvalidColor(_))), "{color:?}");
        }
    }

    #[test]
    fn raw_command_line_breaks() {
        assert!(validate_raw_command("JOIN #forsen").is_ok());
        assert!(validate_raw_command("JOIN #forsen\r\nPART #forsen").is_err());
        assert!(validate_raw_command("PRIVMSG #a :x\n").is_err());
    }
}
