//! Per-variable flag bitmask.
//!
//! Flags qualify how a variable is stored, queried, and rendered. They are
//! carried on the wire as a `u16` and manipulated with the `set-flags` and
//! `clear-flags` requests.

use std::fmt;

/// Flag bitmask attached to every variable.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct VarFlags(u16);

impl VarFlags {
    /// Value may change outside of client writes; never cached by clients.
    pub const VOLATILE: Self = Self(1 << 0);
    /// Writable only by the variable's computed delegate.
    pub const READ_ONLY: Self = Self(1 << 1);
    /// Excluded from every query result, unconditionally.
    pub const HIDDEN: Self = Self(1 << 2);
    /// Set automatically by any value-changing write.
    pub const DIRTY: Self = Self(1 << 3);
    /// Advertised to other hosts by external bridges.
    pub const PUBLIC: Self = Self(1 << 4);
    /// Used as an edge-triggered event source by subscribers.
    pub const TRIGGER: Self = Self(1 << 5);
    /// Every applied write is logged.
    pub const AUDITED: Self = Self(1 << 6);
    /// Value is masked when rendered.
    pub const PASSWORD: Self = Self(1 << 7);

    const ALL: u16 = 0x00ff;

    /// Empty flag set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Constructs a flag set from wire bits, dropping unknown bits.
    #[must_use]
    pub const fn from_bits_truncate(bits: u16) -> Self {
        Self(bits & Self::ALL)
    }

    /// Raw bits for the wire.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Returns `true` if every flag in `other` is present in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Adds the flags in `other`.
    pub const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Removes the flags in `other`.
    pub const fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for VarFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(VarFlags, &str); 8] = [
            (VarFlags::VOLATILE, "VOLATILE"),
            (VarFlags::READ_ONLY, "READ_ONLY"),
            (VarFlags::HIDDEN, "HIDDEN"),
            (VarFlags::DIRTY, "DIRTY"),
            (VarFlags::PUBLIC, "PUBLIC"),
            (VarFlags::TRIGGER, "TRIGGER"),
            (VarFlags::AUDITED, "AUDITED"),
            (VarFlags::PASSWORD, "PASSWORD"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("(empty)")?;
        }
        Ok(())
    }
}
