//! Wire-visible status codes.
//!
//! Every response frame carries one of these codes. The taxonomy is small
//! and stable: local failures (bad arguments, missing entities, capacity or
//! range violations) resolve entirely within a handler; `InProgress` and
//! `StreamedElsewhere` are suspension signals rather than failures, and
//! `AlreadyCurrent` is treated by callers as success.

use std::fmt;

/// Result code carried in every response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StatusCode {
    /// Request completed successfully.
    Ok               = 0,
    /// Malformed or absent inputs.
    InvalidArgument  = 1,
    /// Unknown name, handle, transaction, or search context.
    NotFound         = 2,
    /// Allocation or table-capacity failure.
    OutOfMemory      = 3,
    /// Destination buffer/string/blob capacity exceeded.
    TooBig           = 4,
    /// Numeric value outside the destination type's domain.
    OutOfRange       = 5,
    /// Unknown request code or disallowed type/operation.
    NotSupported     = 6,
    /// Idempotent write: value unchanged. Callers treat this as success.
    AlreadyCurrent   = 7,
    /// Work handed to a delegate; a suspension signal, not a failure.
    InProgress       = 8,
    /// Rendered output will be produced by a delegate via a direct
    /// output hand-off.
    StreamedElsewhere = 9,
    /// The signalled subscriber process no longer exists.
    DelegateGone     = 10,
    /// Group-id permission check failed.
    PermissionDenied = 11,
}

impl StatusCode {
    /// Parses a status code from its wire representation.
    #[must_use]
    pub const fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Ok),
            1 => Some(Self::InvalidArgument),
            2 => Some(Self::NotFound),
            3 => Some(Self::OutOfMemory),
            4 => Some(Self::TooBig),
            5 => Some(Self::OutOfRange),
            6 => Some(Self::NotSupported),
            7 => Some(Self::AlreadyCurrent),
            8 => Some(Self::InProgress),
            9 => Some(Self::StreamedElsewhere),
            10 => Some(Self::DelegateGone),
            11 => Some(Self::PermissionDenied),
            _ => None,
        }
    }

    /// Returns the wire representation.
    #[must_use]
    pub const fn wire(self) -> u16 {
        self as u16
    }

    /// Returns `true` for codes callers treat as a completed request.
    ///
    /// `AlreadyCurrent` reports an idempotent write and `StreamedElsewhere`
    /// reports output that was delivered out of band; both are success from
    /// the caller's point of view.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::AlreadyCurrent | Self::StreamedElsewhere)
    }

    /// Short stable name, used as a metrics label.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::OutOfMemory => "out_of_memory",
            Self::TooBig => "too_big",
            Self::OutOfRange => "out_of_range",
            Self::NotSupported => "not_supported",
            Self::AlreadyCurrent => "already_current",
            Self::InProgress => "in_progress",
            Self::StreamedElsewhere => "streamed_elsewhere",
            Self::DelegateGone => "delegate_gone",
            Self::PermissionDenied => "permission_denied",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_is_stable() {
        for raw in 0..=11u16 {
            let code = StatusCode::from_wire(raw).unwrap();
            assert_eq!(code.wire(), raw);
        }
        assert!(StatusCode::from_wire(12).is_none());
        assert!(StatusCode::from_wire(u16::MAX).is_none());
    }

    #[test]
    fn success_classification() {
        assert!(StatusCode::Ok.is_success());
        assert!(StatusCode::AlreadyCurrent.is_success());
        assert!(StatusCode::StreamedElsewhere.is_success());
        assert!(!StatusCode::InProgress.is_success());
        assert!(!StatusCode::NotFound.is_success());
    }
}
