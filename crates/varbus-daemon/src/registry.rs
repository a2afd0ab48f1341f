//! Client registry.
//!
//! Tracks every live client: process identity, transport, working buffer,
//! push-notification channel, blocked/validation state, and counters.
//! Registrations are recycled, not freed: disconnect parks the slot on an
//! internal free state keeping its working buffer, and a later connect
//! whose requested buffer size matches reuses it before any new slot is
//! taken. A different buffer size means a different registration: the
//! buffer is part of the registration's footprint and is never resized in
//! place.

use tokio::sync::mpsc;
use varbus_core::StatusCode;

use crate::events::{PushFrame, Response, TransportKind};

/// Stable client identity: registry slot index + 1. Zero is never issued.
pub type ClientId = u32;

/// One client registration.
#[derive(Debug)]
pub struct ClientRegistration {
    /// Client id (slot + 1).
    pub id: ClientId,
    /// Owning process id.
    pub pid: u32,
    /// Owning group id, used for permission checks.
    pub gid: u32,
    /// Transport the request connection arrived on.
    pub transport: TransportKind,
    /// Marshaling working buffer; capacity fixed at connect time.
    workbuf: Vec<u8>,
    /// Explicit length of valid bytes in the working buffer.
    workbuf_len: usize,
    /// Push notification channel, attached out of band.
    pub notify: Option<mpsc::Sender<PushFrame>>,
    /// Set while a request of this client is parked awaiting a delegate.
    pub blocked: bool,
    /// In-flight validation transaction id, if any.
    pub validation: Option<u32>,
    /// Held-open reply slot for the write awaiting validation.
    pub validation_reply: Option<tokio::sync::oneshot::Sender<Response>>,
    /// Per-client transaction counter (client-issued correlation ids).
    pub txn_counter: u32,
    /// Requests handled for this client.
    pub requests: u64,
}

impl ClientRegistration {
    fn new(id: ClientId, pid: u32, gid: u32, transport: TransportKind, workbuf: usize) -> Self {
        Self {
            id,
            pid,
            gid,
            transport,
            workbuf: vec![0; workbuf],
            workbuf_len: 0,
            notify: None,
            blocked: false,
            validation: None,
            validation_reply: None,
            txn_counter: 0,
            requests: 0,
        }
    }

    /// Rebinds a recycled registration to a new client, keeping the
    /// working buffer.
    fn rebind(&mut self, pid: u32, gid: u32, transport: TransportKind) {
        self.pid = pid;
        self.gid = gid;
        self.transport = transport;
        self.workbuf_len = 0;
        self.notify = None;
        self.blocked = false;
        self.validation = None;
        self.validation_reply = None;
        self.txn_counter = 0;
        self.requests = 0;
    }

    /// Fixed working-buffer capacity.
    #[must_use]
    pub fn workbuf_capacity(&self) -> usize {
        self.workbuf.len()
    }

    /// Copies marshaled bytes into the working buffer, tracking the
    /// explicit length.
    ///
    /// # Errors
    ///
    /// [`StatusCode::TooBig`] when the bytes exceed the fixed capacity.
    pub fn marshal(&mut self, bytes: &[u8]) -> Result<(), StatusCode> {
        if bytes.len() > self.workbuf.len() {
            return Err(StatusCode::TooBig);
        }
        self.workbuf[..bytes.len()].copy_from_slice(bytes);
        self.workbuf_len = bytes.len();
        Ok(())
    }

    /// Valid bytes currently in the working buffer.
    #[must_use]
    pub fn marshaled(&self) -> &[u8] {
        &self.workbuf[..self.workbuf_len]
    }
}

enum Slot {
    /// Never used.
    Empty,
    /// Recycled registration retaining its working buffer.
    Free(ClientRegistration),
    /// Live client.
    Live(ClientRegistration),
}

/// Fixed-capacity registry of client registrations.
pub struct ClientRegistry {
    slots: Vec<Slot>,
    live: usize,
}

impl ClientRegistry {
    /// Creates a registry with a fixed slot capacity.
    #[must_use]
    pub fn new(max_clients: usize) -> Self {
        let mut slots = Vec::with_capacity(max_clients);
        slots.resize_with(max_clients, || Slot::Empty);
        Self { slots, live: 0 }
    }

    /// Registers a client.
    ///
    /// Reuses a freed registration whose working-buffer capacity matches
    /// `workbuf` before allocating into an empty slot.
    ///
    /// # Errors
    ///
    /// [`StatusCode::OutOfMemory`] when every slot is live or holds a
    /// buffer of the wrong size.
    pub fn connect(
        &mut self,
        pid: u32,
        gid: u32,
        transport: TransportKind,
        workbuf: usize,
    ) -> Result<ClientId, StatusCode> {
        // First pass: a recycled registration with a matching buffer.
        for slot in &mut self.slots {
            if matches!(slot, Slot::Free(reg) if reg.workbuf_capacity() == workbuf) {
                let mut reg = match std::mem::replace(slot, Slot::Empty) {
                    Slot::Free(reg) => reg,
                    _ => unreachable!(),
                };
                reg.rebind(pid, gid, transport);
                let id = reg.id;
                *slot = Slot::Live(reg);
                self.live += 1;
                return Ok(id);
            }
        }
        // Second pass: a never-used slot.
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot, Slot::Empty) {
                let id = (idx + 1) as ClientId;
                *slot = Slot::Live(ClientRegistration::new(id, pid, gid, transport, workbuf));
                self.live += 1;
                return Ok(id);
            }
        }
        // Third pass: evict a recycled registration of the wrong size.
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot, Slot::Free(_)) {
                let id = (idx + 1) as ClientId;
                *slot = Slot::Live(ClientRegistration::new(id, pid, gid, transport, workbuf));
                self.live += 1;
                return Ok(id);
            }
        }
        Err(StatusCode::OutOfMemory)
    }

    /// Looks up a live registration.
    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<&ClientRegistration> {
        match self.slots.get(id.checked_sub(1)? as usize)? {
            Slot::Live(reg) => Some(reg),
            _ => None,
        }
    }

    /// Looks up a live registration mutably.
    #[must_use]
    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientRegistration> {
        match self.slots.get_mut(id.checked_sub(1)? as usize)? {
            Slot::Live(reg) => Some(reg),
            _ => None,
        }
    }

    /// Finds the first live registration owned by `pid`.
    #[must_use]
    pub fn find_by_pid(&mut self, pid: u32) -> Option<&mut ClientRegistration> {
        self.slots.iter_mut().find_map(|slot| match slot {
            Slot::Live(reg) if reg.pid == pid => Some(reg),
            _ => None,
        })
    }

    /// Recycles a registration: the slot keeps its working buffer and
    /// becomes reusable by a future client of the same buffer size.
    ///
    /// Returns the recycled registration's pid, or `None` if `id` was not
    /// live.
    pub fn disconnect(&mut self, id: ClientId) -> Option<u32> {
        let idx = id.checked_sub(1)? as usize;
        let slot = self.slots.get_mut(idx)?;
        if !matches!(slot, Slot::Live(_)) {
            return None;
        }
        let mut reg = match std::mem::replace(slot, Slot::Empty) {
            Slot::Live(reg) => reg,
            _ => unreachable!(),
        };
        let pid = reg.pid;
        reg.notify = None;
        reg.validation_reply = None;
        reg.blocked = false;
        *slot = Slot::Free(reg);
        self.live -= 1;
        Some(pid)
    }

    /// Number of live registrations.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Iterates over live registrations.
    pub fn iter_live(&self) -> impl Iterator<Item = &ClientRegistration> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Live(reg) => Some(reg),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(4)
    }

    #[test]
    fn connect_assigns_dense_ids() {
        let mut reg = registry();
        let a = reg.connect(100, 0, TransportKind::Local, 1024).unwrap();
        let b = reg.connect(101, 0, TransportKind::Local, 1024).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(reg.live_count(), 2);
    }

    #[test]
    fn disconnect_recycles_matching_buffer() {
        let mut reg = registry();
        let a = reg.connect(100, 0, TransportKind::Local, 1024).unwrap();
        reg.disconnect(a).unwrap();
        assert_eq!(reg.live_count(), 0);

        // Same buffer size reuses the recycled slot (same id).
        let b = reg.connect(200, 0, TransportKind::Tcp, 1024).unwrap();
        assert_eq!(b, a);
        assert_eq!(reg.get(b).unwrap().pid, 200);

        // A different size takes a fresh slot instead.
        reg.disconnect(b).unwrap();
        let c = reg.connect(300, 0, TransportKind::Local, 2048).unwrap();
        assert_ne!(c, a);
    }

    #[test]
    fn capacity_exhaustion() {
        let mut reg = registry();
        for pid in 0..4 {
            reg.connect(pid, 0, TransportKind::Local, 64).unwrap();
        }
        assert_eq!(
            reg.connect(99, 0, TransportKind::Local, 64),
            Err(StatusCode::OutOfMemory)
        );
    }

    #[test]
    fn wrong_size_free_slot_is_evicted_as_last_resort() {
        let mut reg = ClientRegistry::new(1);
        let a = reg.connect(1, 0, TransportKind::Local, 64).unwrap();
        reg.disconnect(a).unwrap();
        // No empty slot and no matching buffer; the stale registration is
        // replaced rather than failing the connect.
        let b = reg.connect(2, 0, TransportKind::Local, 128).unwrap();
        assert_eq!(b, a);
        assert_eq!(reg.get(b).unwrap().workbuf_capacity(), 128);
    }

    #[test]
    fn marshal_respects_fixed_capacity() {
        let mut reg = registry();
        let id = reg.connect(1, 0, TransportKind::Local, 4).unwrap();
        let client = reg.get_mut(id).unwrap();
        client.marshal(b"abcd").unwrap();
        assert_eq!(client.marshaled(), b"abcd");
        assert_eq!(client.marshal(b"abcde"), Err(StatusCode::TooBig));
    }
}
