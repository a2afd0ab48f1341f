//! Liveness sweeping.
//!
//! On a fixed interval the dispatcher scans every live registration and
//! probes the owning process with `kill(pid, 0)`. Dead entries are
//! recycled and counted. This is the only reclamation path for clients
//! that crash without an orderly close: their request connection may
//! linger half-open, and their subscriptions are otherwise only demoted
//! lazily at the next delivery attempt.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, info};

use crate::state::ServerContext;

/// Outcome of a `kill(pid, 0)` probe.
///
/// EPERM is discriminated from ESRCH: a process we may not signal still
/// exists and must not be reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Process exists and is signalable.
    Alive,
    /// Process does not exist.
    Dead,
    /// Process exists but belongs to another user.
    Denied,
}

impl Liveness {
    /// Returns `true` when the process exists in any form.
    #[must_use]
    pub const fn exists(self) -> bool {
        !matches!(self, Self::Dead)
    }
}

/// Non-destructive existence probe for a process.
///
/// Pid 0 would signal the whole process group and is reported dead
/// without probing.
#[must_use]
pub fn probe(pid: u32) -> Liveness {
    if pid == 0 {
        return Liveness::Dead;
    }
    #[allow(clippy::cast_possible_wrap)]
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::Dead,
        Err(_) => Liveness::Denied,
    }
}

/// One sweep pass: probes every live registration and reclaims the dead
/// ones. Returns the number of reclaimed registrations.
pub fn sweep(ctx: &mut ServerContext) -> usize {
    let dead: Vec<_> = ctx
        .registry
        .iter_live()
        .filter(|reg| !probe(reg.pid).exists())
        .map(|reg| (reg.id, reg.pid))
        .collect();

    for (id, pid) in &dead {
        info!(client = id, pid, "reclaiming registration for dead process");
        ctx.drop_client(*id);
        ctx.metrics.client_reclaimed();
    }
    if dead.is_empty() {
        debug!(
            live = ctx.registry.live_count(),
            "liveness sweep found nothing to reclaim"
        );
    }
    dead.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert_eq!(probe(std::process::id()), Liveness::Alive);
    }

    #[test]
    fn pid_zero_is_dead_without_probing() {
        assert_eq!(probe(0), Liveness::Dead);
    }

    #[test]
    fn init_exists_even_if_unsignalable() {
        // pid 1 always exists; depending on privileges the probe sees
        // Alive or Denied, never Dead.
        assert!(probe(1).exists());
    }
}
