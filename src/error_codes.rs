//! Numeric codes used by the peer in `ERROR` events and close frames.
//!
//! The peer sends plain integers. Both enums deserialize from and serialize
//! to those integers, and keep unknown values in an `Other` variant so a
//! newer peer never breaks decoding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes carried by `ERROR` event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum ErrorCode {
    UnknownError,
    InvalidPayload,
    InvalidCommand,
    InvalidGuild,
    InvalidEvent,
    InvalidChannel,
    InvalidPermissions,
    InvalidClientId,
    InvalidOrigin,
    InvalidToken,
    InvalidUser,
    OAuth2Error,
    SelectChannelTimedOut,
    GetGuildTimedOut,
    SelectVoiceForceRequired,
    CaptureShortcutAlreadyListening,
    /// A code this client does not know about.
    Other(i64),
}

impl ErrorCode {
    /// Numeric wire value.
    pub fn code(self) -> i64 {
        match self {
            Self::UnknownError => 1000,
            Self::InvalidPayload => 4000,
            Self::InvalidCommand => 4002,
            Self::InvalidGuild => 4003,
            Self::InvalidEvent => 4004,
            Self::InvalidChannel => 4005,
            Self::InvalidPermissions => 4006,
            Self::InvalidClientId => 4007,
            Self::InvalidOrigin => 4008,
            Self::InvalidToken => 4009,
            Self::InvalidUser => 4010,
            Self::OAuth2Error => 5000,
            Self::SelectChannelTimedOut => 5001,
            Self::GetGuildTimedOut => 5002,
            Self::SelectVoiceForceRequired => 5003,
            Self::CaptureShortcutAlreadyListening => 5004,
            Self::Other(code) => code,
        }
    }

    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::UnknownError => "The peer hit an unknown error while handling the request.",
            Self::InvalidPayload => "The payload sent to the peer was malformed or invalid.",
            Self::InvalidCommand => "The command name is not recognized by the peer.",
            Self::InvalidGuild => "The guild referenced by the request does not exist.",
            Self::InvalidEvent => "The event name in a subscribe request is not recognized.",
            Self::InvalidChannel => "The channel referenced by the request does not exist.",
            Self::InvalidPermissions => {
                "The application lacks the permissions required for this command."
            }
            Self::InvalidClientId => "The application ID sent in the handshake is not valid.",
            Self::InvalidOrigin => "The request origin is not allowed for this application.",
            Self::InvalidToken => "The OAuth2 token is invalid or has expired.",
            Self::InvalidUser => "The user referenced by the request does not exist.",
            Self::OAuth2Error => "A generic OAuth2 error occurred.",
            Self::SelectChannelTimedOut => "Selecting the channel timed out.",
            Self::GetGuildTimedOut => "Fetching the guild timed out.",
            Self::SelectVoiceForceRequired => {
                "The user is already in a voice channel; a forced switch is required."
            }
            Self::CaptureShortcutAlreadyListening => "A shortcut capture is already in progress.",
            Self::Other(_) => "Unrecognized error code.",
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        match code {
            1000 => Self::UnknownError,
            4000 => Self::InvalidPayload,
            4002 => Self::InvalidCommand,
            4003 => Self::InvalidGuild,
            4004 => Self::InvalidEvent,
            4005 => Self::InvalidChannel,
            4006 => Self::InvalidPermissions,
            4007 => Self::InvalidClientId,
            4008 => Self::InvalidOrigin,
            4009 => Self::InvalidToken,
            4010 => Self::InvalidUser,
            5000 => Self::OAuth2Error,
            5001 => Self::SelectChannelTimedOut,
            5002 => Self::GetGuildTimedOut,
            5003 => Self::SelectVoiceForceRequired,
            5004 => Self::CaptureShortcutAlreadyListening,
            other => Self::Other(other),
        }
    }
}

impl From<ErrorCode> for i64 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// Codes carried by `Close` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum CloseCode {
    Normal,
    Unsupported,
    Abnormal,
    InvalidClientId,
    InvalidOrigin,
    RateLimited,
    TokenRevoked,
    InvalidVersion,
    InvalidEncoding,
    Other(i64),
}

impl CloseCode {
    pub fn code(self) -> i64 {
        match self {
            Self::Normal => 1000,
            Self::Unsupported => 1003,
            Self::Abnormal => 1006,
            Self::InvalidClientId => 4000,
            Self::InvalidOrigin => 4001,
            Self::RateLimited => 4002,
            Self::TokenRevoked => 4003,
            Self::InvalidVersion => 4004,
            Self::InvalidEncoding => 4005,
            Self::Other(code) => code,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "The connection was closed normally.",
            Self::Unsupported => "The peer does not support the request.",
            Self::Abnormal => "The connection was closed abnormally.",
            Self::InvalidClientId => "The application ID sent in the handshake is not valid.",
            Self::InvalidOrigin => "The connection origin is not allowed.",
            Self::RateLimited => "Too many connections or requests; the peer is rate limiting.",
            Self::TokenRevoked => "The OAuth2 token was revoked.",
            Self::InvalidVersion => "The handshake protocol version is not supported.",
            Self::InvalidEncoding => "The payload encoding is not supported.",
            Self::Other(_) => "Unrecognized close code.",
        }
    }
}

impl From<i64> for CloseCode {
    fn from(code: i64) -> Self {
        match code {
            1000 => Self::Normal,
            1003 => Self::Unsupported,
            1006 => Self::Abnormal,
            4000 => Self::InvalidClientId,
            4001 => Self::InvalidOrigin,
            4002 => Self::RateLimited,
            4003 => Self::TokenRevoked,
            4004 => Self::InvalidVersion,
            4005 => Self::InvalidEncoding,
            other => Self::Other(other),
        }
    }
}

impl From<CloseCode> for i64 {
    fn from(code: CloseCode) -> Self {
        code.code()
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn error_code_numbers_round_trip() {
        for code in [1000, 4000, 4002, 4007, 4010, 5004] {
            assert_eq!(ErrorCode::from(code).code(), code);
            assert!(!matches!(ErrorCode::from(code), ErrorCode::Other(_)));
        }
    }

    #[test]
    fn unknown_codes_are_preserved() {
        assert_eq!(ErrorCode::from(4999), ErrorCode::Other(4999));
        assert_eq!(CloseCode::from(-1).code(), -1);
    }

    #[test]
    fn codes_serialize_as_plain_integers() {
        assert_eq!(serde_json::to_string(&ErrorCode::InvalidClientId).unwrap(), "4007");
        let code: CloseCode = serde_json::from_str("4000").unwrap();
        assert_eq!(code, CloseCode::InvalidClientId);
    }

    #[test]
    fn display_includes_number() {
        assert!(CloseCode::InvalidVersion.to_string().ends_with("(4004)"));
    }
}
