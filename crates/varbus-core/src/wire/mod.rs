//! Bespoke binary wire protocol.
//!
//! Both transports speak the same protocol: every frame is a fixed 32-byte
//! header optionally followed by payload bytes whose shape is implied by
//! the request code. Responses mirror the request header and carry a
//! [`crate::StatusCode`] in the status field.
//!
//! # Frame Layout (all integers big-endian)
//!
//! ```text
//! +--------------+---------+---------+-----------+----------+
//! | protocol id  | version | code    | client id | txn id   |
//! | u32          | u16     | u16     | u32       | u32      |
//! +--------------+---------+---------+-----------+----------+
//! | param1       | param2  | status  | reserved  | length   |
//! | u32          | u32     | u16     | u16       | u32      |
//! +--------------+---------+---------+-----------+----------+
//! | payload (length bytes) ...                              |
//! +---------------------------------------------------------+
//! ```
//!
//! A frame with an unknown protocol id or version still frames correctly
//! (the length field is at a fixed offset), so a mismatched request is
//! rejected for that request only and the connection survives.

mod frame;
mod payload;

pub use frame::{Frame, FrameCodec, FrameHeader, HEADER_LEN, MAX_PAYLOAD};
pub use payload::{
    OpenPayload, QueryDescriptor, VarDescriptor, decode_value, encode_value, get_string,
    put_string, query, value_bytes,
};

use thiserror::Error;

/// Protocol identifier carried in every frame ("VBUS").
pub const PROTOCOL_ID: u32 = 0x5642_5553;

/// Protocol version understood by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum variable name length in bytes.
pub const MAX_NAME_LEN: usize = 64;

/// Maximum format specifier length in bytes.
pub const MAX_FORMAT_LEN: usize = 32;

/// Maximum tags per variable.
pub const MAX_TAGS: usize = 8;

/// Maximum read/write permission group ids per variable.
pub const MAX_GROUPS: usize = 8;

/// `open` request flag: this connection is the client's asynchronous push
/// notification channel, established out of band from the request path.
pub const OPEN_FLAG_NOTIFY_CHANNEL: u32 = 1 << 0;

/// Request codes, ordinal and stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RequestCode {
    /// Register a client (or attach a notify channel) and size its
    /// working buffer.
    Open                   = 1,
    /// Orderly disconnect; the registration is recycled.
    Close                  = 2,
    /// Liveness ping; payload is echoed back.
    Echo                   = 3,
    /// Create a variable from a descriptor payload.
    Create                 = 4,
    /// Look up a handle by (name, instance).
    Find                   = 5,
    /// Read a variable's value.
    Get                    = 6,
    /// Render a variable's value as text.
    Print                  = 7,
    /// Write a variable's value.
    Set                    = 8,
    /// Read a variable's type tag.
    GetType                = 9,
    /// Read a variable's name.
    GetName                = 10,
    /// Read a variable's stored length.
    GetLength              = 11,
    /// Register for a notification kind on a variable.
    Subscribe              = 12,
    /// Remove a notification registration.
    Unsubscribe            = 13,
    /// Validator: fetch the oldest pending validation request.
    GetPendingValidation   = 14,
    /// Validator: accept or reject a pending write.
    SendValidationResponse = 15,
    /// Render delegate: open a render session for a transaction.
    OpenRenderSession      = 16,
    /// Render delegate: close a render session, releasing the requester.
    CloseRenderSession     = 17,
    /// Start a query; returns a cursor context.
    QueryFirst             = 18,
    /// Advance a query cursor.
    QueryNext              = 19,
    /// OR flags into a variable's bitmask.
    SetFlags               = 20,
    /// Clear flags from a variable's bitmask.
    ClearFlags             = 21,
}

impl RequestCode {
    /// Parses a request code from the wire; `None` routes to the invalid
    /// handler.
    #[must_use]
    pub const fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Open),
            2 => Some(Self::Close),
            3 => Some(Self::Echo),
            4 => Some(Self::Create),
            5 => Some(Self::Find),
            6 => Some(Self::Get),
            7 => Some(Self::Print),
            8 => Some(Self::Set),
            9 => Some(Self::GetType),
            10 => Some(Self::GetName),
            11 => Some(Self::GetLength),
            12 => Some(Self::Subscribe),
            13 => Some(Self::Unsubscribe),
            14 => Some(Self::GetPendingValidation),
            15 => Some(Self::SendValidationResponse),
            16 => Some(Self::OpenRenderSession),
            17 => Some(Self::CloseRenderSession),
            18 => Some(Self::QueryFirst),
            19 => Some(Self::QueryNext),
            20 => Some(Self::SetFlags),
            21 => Some(Self::ClearFlags),
            _ => None,
        }
    }

    /// Wire representation.
    #[must_use]
    pub const fn wire(self) -> u16 {
        self as u16
    }

    /// Short stable name, used as a metrics label.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Echo => "echo",
            Self::Create => "create",
            Self::Find => "find",
            Self::Get => "get",
            Self::Print => "print",
            Self::Set => "set",
            Self::GetType => "get_type",
            Self::GetName => "get_name",
            Self::GetLength => "get_length",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::GetPendingValidation => "get_pending_validation",
            Self::SendValidationResponse => "send_validation_response",
            Self::OpenRenderSession => "open_render_session",
            Self::CloseRenderSession => "close_render_session",
            Self::QueryFirst => "query_first",
            Self::QueryNext => "query_next",
            Self::SetFlags => "set_flags",
            Self::ClearFlags => "clear_flags",
        }
    }
}

/// Server-to-client push frame codes.
///
/// Push frames share the request frame layout and travel only on the
/// client's notify channel. Codes 64 and up are reserved for pushes so
/// they can never collide with a request code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PushCode {
    /// A subscribed variable changed: param1 = handle, payload = new value.
    Modified = 64,
    /// Delegate signal: param1 = handle, param2 = kind, txn id = the
    /// transaction awaiting this delegate's answer.
    Signal   = 65,
}

impl PushCode {
    /// Parses a push code from the wire.
    #[must_use]
    pub const fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            64 => Some(Self::Modified),
            65 => Some(Self::Signal),
            _ => None,
        }
    }

    /// Wire representation.
    #[must_use]
    pub const fn wire(self) -> u16 {
        self as u16
    }
}

/// Notification kinds.
///
/// `Modified` fans out to many subscribers; the other three are singleton
/// delegate kinds with at most one active subscriber per variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NotifyKind {
    /// Fan-out: the variable's value changed.
    Modified  = 1,
    /// Singleton: a delegate computes the value on demand.
    Computed  = 2,
    /// Singleton: a delegate validates writes before they apply.
    Validated = 3,
    /// Singleton: a delegate renders the value on demand.
    Rendered  = 4,
}

impl NotifyKind {
    /// Parses a kind from its wire representation.
    #[must_use]
    pub const fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Modified),
            2 => Some(Self::Computed),
            3 => Some(Self::Validated),
            4 => Some(Self::Rendered),
            _ => None,
        }
    }

    /// Wire representation.
    #[must_use]
    pub const fn wire(self) -> u32 {
        self as u32
    }

    /// Bit in a variable's notification-kind summary mask.
    #[must_use]
    pub const fn mask_bit(self) -> u8 {
        1 << (self as u8 - 1)
    }

    /// Returns `true` for kinds admitting at most one subscriber per
    /// variable.
    #[must_use]
    pub const fn is_singleton(self) -> bool {
        !matches!(self, Self::Modified)
    }

    /// Short stable name, used as a metrics label.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Modified => "modified",
            Self::Computed => "computed",
            Self::Validated => "validated",
            Self::Rendered => "rendered",
        }
    }
}

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame length prefix exceeds [`MAX_PAYLOAD`]; detected before
    /// allocation.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Payload size from the length field.
        size: usize,
        /// Maximum allowed payload size.
        max: usize,
    },

    /// Payload bytes do not match the shape implied by the request code.
    #[error("malformed payload: {reason}")]
    Malformed {
        /// Description of the decode failure.
        reason: &'static str,
    },

    /// Underlying I/O error from the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Creates a malformed-payload error.
    #[must_use]
    pub const fn malformed(reason: &'static str) -> Self {
        Self::Malformed { reason }
    }
}
