// Line protocol between a coordinator server and its remote clients
//
// One ASCII line per message: a single command byte, exactly 86 resource id
// characters with no delimiter, then a command-specific trailing segment.
// `unlock` and `folder-changed` carry an mtime before the token, where the
// lone character `-` means "no modification".

use crate::locks::engine::{InvalidResourceId, ResourceId, RESOURCE_ID_LEN};

/// Sent by the server as the first line of every connection. A client that
/// reads anything else hangs up; this is a sanity/version check, not auth.
pub const PROTOCOL_MAGIC: &str = "ROOTLOCK/1";

/// Wire sentinel for "no modification" in the unlock mtime field.
pub const NO_MTIME: &str = "-";

/// A request decoded from a client line.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Subscribe { resource: ResourceId, token: String },
    Unsubscribe { resource: ResourceId, token: String },
    Lock { resource: ResourceId, token: String },
    PartialLock { resource: ResourceId, token: String },
    Unlock { resource: ResourceId, mtime: Option<f64>, token: String },
}

/// A notification decoded from a server line.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Granted { resource: ResourceId, token: String },
    FlushRequested { resource: ResourceId, token: String },
    FolderChanged { resource: ResourceId, mtime: f64, token: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("line shorter than a protocol frame: {0:?}")]
    Truncated(String),
    #[error("line is not ascii: {0:?}")]
    NotAscii(String),
    #[error("unknown command byte {0:?}")]
    UnknownCommand(char),
    #[error(transparent)]
    Resource(#[from] InvalidResourceId),
    #[error("malformed mtime field {0:?}")]
    Mtime(String),
    #[error("malformed trailing segment {0:?}")]
    Trailing(String),
    #[error("bad handshake line {0:?}, expected {PROTOCOL_MAGIC:?}")]
    Handshake(String),
}

/// Validate the server's opening line.
pub fn check_magic(line: &str) -> Result<(), ProtoError> {
    if line == PROTOCOL_MAGIC {
        Ok(())
    } else {
        Err(ProtoError::Handshake(line.to_string()))
    }
}

fn format_mtime(mtime: Option<f64>) -> String {
    match mtime {
        None => NO_MTIME.to_string(),
        Some(m) => format!("{m}"),
    }
}

fn parse_mtime(field: &str) -> Result<Option<f64>, ProtoError> {
    if field == NO_MTIME {
        return Ok(None);
    }
    field
        .parse::<f64>()
        .map(Some)
        .map_err(|_| ProtoError::Mtime(field.to_string()))
}

/// Encode a client request as one line (no trailing newline).
pub fn encode_command(cmd: &ClientCommand) -> String {
    match cmd {
        ClientCommand::Subscribe { resource, token } => format!("s{resource}{token}"),
        ClientCommand::Unsubscribe { resource, token } => format!("U{resource}{token}"),
        ClientCommand::Lock { resource, token } => format!("l{resource}{token}"),
        ClientCommand::PartialLock { resource, token } => format!("i{resource}{token}"),
        ClientCommand::Unlock { resource, mtime, token } => {
            format!("u{resource}{} {token}", format_mtime(*mtime))
        }
    }
}

/// Encode a server notification as one line (no trailing newline).
pub fn encode_event(event: &ServerEvent) -> String {
    match event {
        ServerEvent::Granted { resource, token } => format!("l{resource}{token}"),
        ServerEvent::FlushRequested { resource, token } => format!("f{resource}{token}"),
        ServerEvent::FolderChanged { resource, mtime, token } => {
            format!("n{resource}{mtime} {token}")
        }
    }
}

/// Split a line into its command byte, resource id, and trailing segment.
fn split_frame(line: &str) -> Result<(char, ResourceId, &str), ProtoError> {
    if !line.is_ascii() {
        return Err(ProtoError::NotAscii(line.to_string()));
    }
    if line.len() < 1 + RESOURCE_ID_LEN {
        return Err(ProtoError::Truncated(line.to_string()));
    }
    let cmd = line.as_bytes()[0] as char;
    let resource = ResourceId::new(&line[1..=RESOURCE_ID_LEN])?;
    Ok((cmd, resource, &line[1 + RESOURCE_ID_LEN..]))
}

/// Split an `<mtime> <token>` trailing segment.
fn split_mtime_segment(rest: &str) -> Result<(&str, &str), ProtoError> {
    rest.split_once(' ')
        .ok_or_else(|| ProtoError::Trailing(rest.to_string()))
}

/// Decode one line arriving at the server.
pub fn decode_command(line: &str) -> Result<ClientCommand, ProtoError> {
    let (cmd, resource, rest) = split_frame(line)?;
    match cmd {
        's' => Ok(ClientCommand::Subscribe { resource, token: rest.to_string() }),
        'U' => Ok(ClientCommand::Unsubscribe { resource, token: rest.to_string() }),
        'l' => Ok(ClientCommand::Lock { resource, token: rest.to_string() }),
        'i' => Ok(ClientCommand::PartialLock { resource, token: rest.to_string() }),
        'u' => {
            let (mtime, token) = split_mtime_segment(rest)?;
            Ok(ClientCommand::Unlock {
                resource,
                mtime: parse_mtime(mtime)?,
                token: token.to_string(),
            })
        }
        other => Err(ProtoError::UnknownCommand(other)),
    }
}

/// Decode one line arriving at a client.
pub fn decode_event(line: &str) -> Result<ServerEvent, ProtoError> {
    let (cmd, resource, rest) = split_frame(line)?;
    match cmd {
        'l' => Ok(ServerEvent::Granted { resource, token: rest.to_string() }),
        'f' => Ok(ServerEvent::FlushRequested { resource, token: rest.to_string() }),
        'n' => {
            let (mtime, token) = split_mtime_segment(rest)?;
            let mtime = parse_mtime(mtime)?
                .ok_or_else(|| ProtoError::Mtime(mtime.to_string()))?;
            Ok(ServerEvent::FolderChanged { resource, mtime, token: token.to_string() })
        }
        other => Err(ProtoError::UnknownCommand(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(tag: &str) -> ResourceId {
        let mut id = String::from(tag);
        while id.len() < RESOURCE_ID_LEN {
            id.push('0');
        }
        ResourceId::new(id).unwrap()
    }

    #[test]
    fn test_lock_round_trip() {
        let cmd = ClientCommand::Lock { resource: rid("R1"), token: "42".to_string() };
        let line = encode_command(&cmd);
        assert_eq!(line.len(), 1 + RESOURCE_ID_LEN + 2);
        assert!(line.starts_with("lR1"));
        assert_eq!(decode_command(&line).unwrap(), cmd);
    }

    #[test]
    fn test_unlock_mtime_forms() {
        let with = ClientCommand::Unlock {
            resource: rid("R1"),
            mtime: Some(1712345678.25),
            token: "7".to_string(),
        };
        assert_eq!(decode_command(&encode_command(&with)).unwrap(), with);

        let without = ClientCommand::Unlock {
            resource: rid("R1"),
            mtime: None,
            token: "7".to_string(),
        };
        let line = encode_command(&without);
        assert!(line.contains("- 7"));
        assert_eq!(decode_command(&line).unwrap(), without);
    }

    #[test]
    fn test_event_round_trips() {
        for event in [
            ServerEvent::Granted { resource: rid("A"), token: "9".to_string() },
            ServerEvent::FlushRequested { resource: rid("A"), token: "9".to_string() },
            ServerEvent::FolderChanged { resource: rid("A"), mtime: 5.0, token: "9".to_string() },
        ] {
            assert_eq!(decode_event(&encode_event(&event)).unwrap(), event);
        }
    }

    #[test]
    fn test_integer_mtime_survives_display() {
        // f64 Display renders 5.0 as "5"; the parser must accept both forms.
        let line = encode_event(&ServerEvent::FolderChanged {
            resource: rid("A"),
            mtime: 5.0,
            token: "t".to_string(),
        });
        assert!(line.contains("5 t"));
        assert!(decode_event(&line).is_ok());
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert!(matches!(decode_command("l"), Err(ProtoError::Truncated(_))));
        let line = format!("z{}tok", rid("A"));
        assert!(matches!(decode_command(&line), Err(ProtoError::UnknownCommand('z'))));
        let line = format!("u{}notime", rid("A"));
        assert!(matches!(decode_command(&line), Err(ProtoError::Trailing(_))));
        let line = format!("u{}x y", rid("A"));
        assert!(matches!(decode_command(&line), Err(ProtoError::Mtime(_))));
        assert!(matches!(decode_command("lλλλ"), Err(ProtoError::NotAscii(_))));
    }

    #[test]
    fn test_handshake_check() {
        assert!(check_magic(PROTOCOL_MAGIC).is_ok());
        assert!(check_magic("ROOTLOCK/2").is_err());
    }
}
