use std::fmt;

/// Errno-style constants carried in response envelopes.
///
/// The wire protocol transmits numeric error codes in the response errnum
/// slot; peers agree on these values regardless of host platform.
pub mod errnum {
    pub const EPERM: i32 = 1;
    pub const EINVAL: i32 = 22;
    pub const ENOSYS: i32 = 38;
    pub const ENODATA: i32 = 61;
    pub const EPROTO: i32 = 71;
    pub const ECONNRESET: i32 = 104;
    pub const EHOSTUNREACH: i32 = 113;
    pub const ETIMEDOUT: i32 = 110;
}

/// Classification of envelope-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoErrorKind {
    /// Caller supplied something malformed (EINVAL class).
    Invalid,
    /// A received message is missing a required field or has one of the
    /// wrong type (EPROTO class).
    Protocol,
    /// The byte stream could not be decoded into frames.
    Decode,
    /// The credential check failed (EPERM class).
    Permission,
}

/// Error type for message construction, accessors, and the codec.
///
/// These functions never log; the calling layer decides how to render the
/// failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoError {
    kind: ProtoErrorKind,
    message: String,
}

impl ProtoError {
    pub fn new(kind: ProtoErrorKind, message: impl Into<String>) -> Self {
        ProtoError {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ProtoErrorKind::Invalid, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ProtoErrorKind::Protocol, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ProtoErrorKind::Decode, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ProtoErrorKind::Permission, message)
    }

    pub fn kind(&self) -> ProtoErrorKind {
        self.kind
    }

    /// The errno-class code a service would place in a response envelope
    /// for this error.
    pub fn errnum(&self) -> i32 {
        match self.kind {
            ProtoErrorKind::Invalid => errnum::EINVAL,
            ProtoErrorKind::Protocol | ProtoErrorKind::Decode => errnum::EPROTO,
            ProtoErrorKind::Permission => errnum::EPERM,
        }
    }
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ProtoErrorKind::Invalid => "invalid argument",
            ProtoErrorKind::Protocol => "protocol error",
            ProtoErrorKind::Decode => "decode error",
            ProtoErrorKind::Permission => "permission denied",
        };
        write!(f, "{}: {}", kind, self.message)
    }
}

impl std::error::Error for ProtoError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errnum_mapping() {
        assert_eq!(ProtoError::invalid("x").errnum(), errnum::EINVAL);
        assert_eq!(ProtoError::protocol("x").errnum(), errnum::EPROTO);
        assert_eq!(ProtoError::decode("x").errnum(), errnum::EPROTO);
        assert_eq!(ProtoError::permission("x").errnum(), errnum::EPERM);
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = ProtoError::protocol("missing topic frame");
        let s = format!("{}", err);
        assert!(s.contains("protocol error"));
        assert!(s.contains("missing topic frame"));
    }
}
