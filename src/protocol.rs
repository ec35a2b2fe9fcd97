use std::fmt;

use crate::error::ProtocolError;

pub const MAX_USERNAME_LEN: usize = 32;

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    User(String),
    Msg(String),
    MsgTo { to: String, text: String },
    Img(String),
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Users(Vec<String>),
    Msg { user: String, time: String, text: String },
    Img { user: String, time: String, data: String },
    Sys { time: String, text: String },
    Private { from: String, text: String },
}

pub fn parse_command(line: &str) -> Result<Command, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);

    if line.trim().is_empty() {
        return Err(ProtocolError::Empty);
    }

    if let Some(name) = line.strip_prefix("USER:") {
        return Ok(Command::User(name.trim().to_string()));
    }

    if let Some(text) = line.strip_prefix("MSG:") {
        return Ok(Command::Msg(text.trim().to_string()));
    }

    if line.starts_with("MSGTO:") {
        // the text keeps any colons it carries
        let parts: Vec<&str> = line.splitn(3, ':').collect();
        if parts.len() != 3 {
            return Err(ProtocolError::Malformed("MSGTO"));
        }

        return Ok(Command::MsgTo {
            to: parts[1].trim().to_string(),
            text: parts[2].trim().to_string(),
        });
    }

    if let Some(data) = line.strip_prefix("IMG:") {
        return Ok(Command::Img(data.trim().to_string()));
    }

    let head = line.split(':').next().unwrap_or_default();
    Err(ProtocolError::Unknown(head.to_string()))
}

pub fn parse_reply(line: &str) -> Result<Reply, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);

    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }

    if let Some(list) = line.strip_prefix("USERS:") {
        let users = list
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect();

        return Ok(Reply::Users(users));
    }

    if let Some(rest) = line.strip_prefix("MSG:") {
        let (user, time, text) = split_tagged(rest).ok_or(ProtocolError::Malformed("MSG"))?;
        return Ok(Reply::Msg { user, time, text });
    }

    if let Some(rest) = line.strip_prefix("IMG:") {
        let (user, time, data) = split_tagged(rest).ok_or(ProtocolError::Malformed("IMG"))?;
        return Ok(Reply::Img { user, time, data });
    }

    if let Some(rest) = line.strip_prefix("SYS:") {
        let (time, text) = rest.split_once('|').ok_or(ProtocolError::Malformed("SYS"))?;
        return Ok(Reply::Sys {
            time: time.to_string(),
            text: text.to_string(),
        });
    }

    if let Some(rest) = line.strip_prefix("[Privado de ") {
        let (from, text) = rest.split_once("]: ").ok_or(ProtocolError::Malformed("private"))?;
        return Ok(Reply::Private {
            from: from.to_string(),
            text: text.to_string(),
        });
    }

    let head = line.split(':').next().unwrap_or_default();
    Err(ProtocolError::Unknown(head.to_string()))
}

fn split_tagged(rest: &str) -> Option<(String, String, String)> {
    let mut parts = rest.splitn(3, '|');

    let user = parts.next()?;
    let time = parts.next()?;
    let body = parts.next()?;

    Some((user.to_string(), time.to_string(), body.to_string()))
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::User(name) => write!(f, "USER:{name}"),
            Command::Msg(text) => write!(f, "MSG:{text}"),
            Command::MsgTo { to, text } => write!(f, "MSGTO:{to}:{text}"),
            Command::Img(data) => write!(f, "IMG:{data}"),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Users(users) => write!(f, "USERS:{}", users.join(",")),
            Reply::Msg { user, time, text } => write!(f, "MSG:{user}|{time}|{text}"),
            Reply::Img { user, time, data } => write!(f, "IMG:{user}|{time}|{data}"),
            Reply::Sys { time, text } => write!(f, "SYS:{time}|{text}"),
            Reply::Private { from, text } => write!(f, "[Privado de {from}]: {text}"),
        }
    }
}

/// User list as carried by `USERS`: deduplicated and lexicographically sorted.
pub fn sorted_users<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut users: Vec<String> = names.into_iter().map(Into::into).collect();
    users.sort();
    users.dedup();

    users
}

/// Strips the characters that would break the wire format and caps the
/// length. Returns `None` when nothing usable is left.
pub fn sanitize_username(raw: &str) -> Option<String> {
    let name: String = raw
        .trim()
        .chars()
        .take(MAX_USERNAME_LEN)
        .map(|c| match c {
            '|' | ':' | ',' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if name.trim().is_empty() {
        None
    } else {
        Some(name)
    }
}

/// `HH:mm:ss` stamp used in every timed reply.
pub fn clock() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_command_kind() {
        assert_eq!(parse_command("USER: alice "), Ok(Command::User("alice".into())));
        assert_eq!(parse_command("MSG:hello\r"), Ok(Command::Msg("hello".into())));
        assert_eq!(parse_command("IMG:aGk="), Ok(Command::Img("aGk=".into())));
    }

    #[test]
    fn msgto_keeps_colons_in_text() {
        let cmd = parse_command("MSGTO:bob:meet at 10:30: ok").unwrap();

        assert_eq!(
            cmd,
            Command::MsgTo {
                to: "bob".into(),
                text: "meet at 10:30: ok".into()
            }
        );
    }

    #[test]
    fn msgto_without_text_is_malformed() {
        assert_eq!(parse_command("MSGTO:bob"), Err(ProtocolError::Malformed("MSGTO")));
    }

    #[test]
    fn unknown_lines_are_rejected() {
        assert_eq!(parse_command("HELLO:x"), Err(ProtocolError::Unknown("HELLO".into())));
        assert_eq!(parse_command("   "), Err(ProtocolError::Empty));
    }

    #[test]
    fn replies_render_wire_form() {
        let msg = Reply::Msg {
            user: "alice".into(),
            time: "10:00:00".into(),
            text: "hi".into(),
        };
        assert_eq!(msg.to_string(), "MSG:alice|10:00:00|hi");

        let private = Reply::Private {
            from: "alice".into(),
            text: "psst".into(),
        };
        assert_eq!(private.to_string(), "[Privado de alice]: psst");

        let sys = Reply::Sys {
            time: "10:00:00".into(),
            text: "bob connected".into(),
        };
        assert_eq!(sys.to_string(), "SYS:10:00:00|bob connected");
    }

    #[test]
    fn users_reply_is_sorted_and_deduplicated() {
        let reply = Reply::Users(sorted_users(["carol", "alice", "bob", "alice"]));

        assert_eq!(reply.to_string(), "USERS:alice,bob,carol");
    }

    #[test]
    fn parses_server_lines() {
        assert_eq!(
            parse_reply("USERS:alice,bob,"),
            Ok(Reply::Users(vec!["alice".into(), "bob".into()]))
        );
        assert_eq!(parse_reply("USERS:"), Ok(Reply::Users(vec![])));
        assert_eq!(
            parse_reply("MSG:alice|10:00:00|a|b"),
            Ok(Reply::Msg {
                user: "alice".into(),
                time: "10:00:00".into(),
                text: "a|b".into()
            })
        );
        assert_eq!(
            parse_reply("[Privado de bob]: see you"),
            Ok(Reply::Private {
                from: "bob".into(),
                text: "see you".into()
            })
        );
        assert!(parse_reply("MSG:broken").is_err());
    }

    #[test]
    fn sanitizes_usernames() {
        assert_eq!(sanitize_username(" a|b:c\td "), Some("a_b_c_d".into()));
        assert_eq!(sanitize_username("   "), None);

        let long = "x".repeat(40);
        assert_eq!(sanitize_username(&long).map(|n| n.len()), Some(MAX_USERNAME_LEN));
    }

    #[test]
    fn clock_is_hh_mm_ss() {
        let stamp = clock();

        assert_eq!(stamp.len(), 8);
        assert_eq!(stamp.matches(':').count(), 2);
    }
}
