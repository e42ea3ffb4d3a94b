use super::announcement::{PAYLOAD_CLOSE, PAYLOAD_OPEN, POSITION_CLOSED, POSITION_OPEN};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unrecognized command {0:?}")]
    UnrecognizedCommand(String),

    #[error("command payload is not UTF-8")]
    NotUtf8,
}

/// Commands accepted on a blind's `set` topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlindCommand {
    Open,
    Close,
}

impl BlindCommand {
    /// Decodes a raw MQTT payload. Surrounding whitespace is ignored, case is not.
    pub fn decode(payload: &[u8]) -> Result<Self, CommandError> {
        std::str::from_utf8(payload)
            .map_err(|_| CommandError::NotUtf8)?
            .parse()
    }

    pub fn target_position(self) -> u8 {
        match self {
            BlindCommand::Open => POSITION_OPEN,
            BlindCommand::Close => POSITION_CLOSED,
        }
    }
}

impl FromStr for BlindCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            PAYLOAD_OPEN => Ok(BlindCommand::Open),
            PAYLOAD_CLOSE => Ok(BlindCommand::Close),
            other => Err(CommandError::UnrecognizedCommand(other.to_string())),
        }
    }
}

impl fmt::Display for BlindCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlindCommand::Open => f.write_str(PAYLOAD_OPEN),
            BlindCommand::Close => f.write_str(PAYLOAD_CLOSE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_open_and_close() {
        assert_eq!(BlindCommand::decode(b"OPEN"), Ok(BlindCommand::Open));
        assert_eq!(BlindCommand::decode(b" CLOSE\n"), Ok(BlindCommand::Close));
        assert_eq!(BlindCommand::Open.target_position(), 0);
        assert_eq!(BlindCommand::Close.target_position(), 100);
    }

    #[test]
    fn rejects_everything_else() {
        for payload in [&b"open"[..], b"STOP", b"", b"50", b"OPEN CLOSE"] {
            assert!(
                matches!(BlindCommand::decode(payload), Err(CommandError::UnrecognizedCommand(_))),
                "{payload:?} accepted"
            );
        }
        assert_eq!(BlindCommand::decode(&[0xff, 0xfe]), Err(CommandError::NotUtf8));
    }

    #[test]
    fn display_matches_wire_payload() {
        for command in [BlindCommand::Open, BlindCommand::Close] {
            assert_eq!(command.to_string().parse::<BlindCommand>(), Ok(command));
        }
    }
}
