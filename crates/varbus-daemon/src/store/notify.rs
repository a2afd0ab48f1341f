//! Per-variable notification registrations.
//!
//! Each variable carries one `NotificationSet`: a fan-out list of
//! "modified" subscribers and zero-or-one delegate per singleton kind
//! (computed, validated, rendered), plus a kind bitmask summarizing which
//! kinds currently have a registration. Delivery failures demote the
//! registration lazily rather than eagerly scanning for dead processes.

use varbus_core::{NotifyKind, StatusCode};

/// A "modified" fan-out subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifiedSub {
    /// Subscriber process id.
    pub pid: u32,
    /// Set while a push for this subscriber is outstanding.
    pub pending: bool,
}

/// Notification registrations for one variable.
#[derive(Debug, Default)]
pub struct NotificationSet {
    modified: Vec<ModifiedSub>,
    computed: Option<u32>,
    validated: Option<u32>,
    rendered: Option<u32>,
    mask: u8,
}

impl NotificationSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Kind bitmask summarizing current registrations
    /// ([`NotifyKind::mask_bit`] bits).
    #[must_use]
    pub const fn mask(&self) -> u8 {
        self.mask
    }

    /// Returns `true` when `kind` has at least one registration.
    #[must_use]
    pub const fn has(&self, kind: NotifyKind) -> bool {
        self.mask & kind.mask_bit() != 0
    }

    /// The singleton delegate pid for `kind`, if registered.
    ///
    /// Returns `None` for the fan-out kind.
    #[must_use]
    pub const fn delegate(&self, kind: NotifyKind) -> Option<u32> {
        match kind {
            NotifyKind::Modified => None,
            NotifyKind::Computed => self.computed,
            NotifyKind::Validated => self.validated,
            NotifyKind::Rendered => self.rendered,
        }
    }

    /// Registers `pid` for `kind`.
    ///
    /// Fan-out registration is idempotent per pid. Singleton kinds reuse
    /// an abandoned slot or an existing match; a second live delegate is
    /// refused.
    ///
    /// # Errors
    ///
    /// [`StatusCode::NotSupported`] when a singleton kind already has a
    /// different live delegate.
    pub fn register(&mut self, kind: NotifyKind, pid: u32) -> Result<(), StatusCode> {
        match kind {
            NotifyKind::Modified => {
                if !self.modified.iter().any(|sub| sub.pid == pid) {
                    self.modified.push(ModifiedSub { pid, pending: false });
                }
            }
            NotifyKind::Computed | NotifyKind::Validated | NotifyKind::Rendered => {
                let slot = self.singleton_mut(kind);
                match slot {
                    Some(existing) if *existing != pid => return Err(StatusCode::NotSupported),
                    _ => *slot = Some(pid),
                }
            }
        }
        self.mask |= kind.mask_bit();
        Ok(())
    }

    /// Removes the registration of `pid` for `kind`.
    ///
    /// # Errors
    ///
    /// [`StatusCode::NotFound`] when `pid` holds no such registration.
    pub fn unregister(&mut self, kind: NotifyKind, pid: u32) -> Result<(), StatusCode> {
        match kind {
            NotifyKind::Modified => {
                let before = self.modified.len();
                self.modified.retain(|sub| sub.pid != pid);
                if self.modified.len() == before {
                    return Err(StatusCode::NotFound);
                }
                if self.modified.is_empty() {
                    self.mask &= !kind.mask_bit();
                }
            }
            NotifyKind::Computed | NotifyKind::Validated | NotifyKind::Rendered => {
                let slot = self.singleton_mut(kind);
                if *slot != Some(pid) {
                    return Err(StatusCode::NotFound);
                }
                *slot = None;
                self.mask &= !kind.mask_bit();
            }
        }
        Ok(())
    }

    /// Demotes a registration after a failed delivery: the slot is
    /// cleared and the kind bit dropped, without an error if the
    /// registration had already gone.
    pub fn demote(&mut self, kind: NotifyKind, pid: u32) {
        let _ = self.unregister(kind, pid);
    }

    /// Snapshot of the fan-out subscriber pids.
    #[must_use]
    pub fn modified_pids(&self) -> Vec<u32> {
        self.modified.iter().map(|sub| sub.pid).collect()
    }
}

impl NotificationSet {
    fn singleton_mut(&mut self, kind: NotifyKind) -> &mut Option<u32> {
        match kind {
            NotifyKind::Computed => &mut self.computed,
            NotifyKind::Validated => &mut self.validated,
            NotifyKind::Rendered => &mut self.rendered,
            NotifyKind::Modified => unreachable!("modified is not a singleton kind"),
        }
    }
}
