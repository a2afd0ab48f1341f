//! Delegation correlation: transactions and the blocked-request queue.
//!
//! A delegated request (computed read, validated write, rendered print)
//! walks Idle → Delegated → AwaitingDelegateReply → Completed, with
//! Abandoned reachable when signal delivery finds the delegate gone. The
//! transaction row is the sole correlation between the delegate's eventual
//! answer and the original caller; it is removed exactly once, on the
//! first matching answer, and never reused.
//!
//! Blocked requesters (computed/rendered kinds) park their reply slot
//! here; validated writers hold their reply open on their registration
//! instead and are not queued.

use std::collections::VecDeque;
use std::os::fd::OwnedFd;

use tokio::sync::oneshot;
use varbus_core::{Handle, NotifyKind, VarValue};

use crate::events::Response;
use crate::registry::ClientId;

/// Kind-specific transaction payload.
#[derive(Debug)]
pub enum TxnPayload {
    /// Computed read: nothing beyond the correlation itself.
    Computed,
    /// Validated write: the proposed value, re-applied on accept.
    Validation {
        /// The value the writer proposed.
        proposed: VarValue,
        /// The writer whose reply is held open.
        writer: ClientId,
    },
    /// Rendered print: the requester's output descriptor, handed to the
    /// delegate when it opens the session.
    Render {
        /// Output descriptor; taken by `open-render-session`.
        fd: Option<OwnedFd>,
        /// Set once the delegate has opened the session.
        opened: bool,
    },
}

/// One in-flight delegated request.
#[derive(Debug)]
pub struct Transaction {
    /// Monotonically increasing identifier.
    pub id: u32,
    /// The delegated kind.
    pub kind: NotifyKind,
    /// Target variable.
    pub handle: Handle,
    /// Delegate the signal went to.
    pub delegate_pid: u32,
    /// Originating client's process id.
    pub origin_pid: u32,
    /// Kind-specific payload.
    pub payload: TxnPayload,
}

/// Table of in-flight delegated requests.
#[derive(Debug, Default)]
pub struct TransactionTable {
    rows: Vec<Transaction>,
    next_id: u32,
}

impl TransactionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a transaction, returning its id.
    pub fn open(
        &mut self,
        kind: NotifyKind,
        handle: Handle,
        delegate_pid: u32,
        origin_pid: u32,
        payload: TxnPayload,
    ) -> u32 {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let id = self.next_id;
        self.rows.push(Transaction {
            id,
            kind,
            handle,
            delegate_pid,
            origin_pid,
            payload,
        });
        id
    }

    /// Removes and returns a transaction by id. Each row can be taken at
    /// most once.
    pub fn take(&mut self, id: u32) -> Option<Transaction> {
        let idx = self.rows.iter().position(|txn| txn.id == id)?;
        Some(self.rows.remove(idx))
    }

    /// Borrows a transaction by id.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&Transaction> {
        self.rows.iter().find(|txn| txn.id == id)
    }

    /// Borrows a transaction mutably by id.
    #[must_use]
    pub fn get_mut(&mut self, id: u32) -> Option<&mut Transaction> {
        self.rows.iter_mut().find(|txn| txn.id == id)
    }

    /// Returns `true` when a validation is in flight for `handle`.
    ///
    /// Validation is exclusive per variable: a second writer is refused
    /// while this holds.
    #[must_use]
    pub fn has_validation_for(&self, handle: Handle) -> bool {
        self.rows
            .iter()
            .any(|txn| txn.kind == NotifyKind::Validated && txn.handle == handle)
    }

    /// The oldest pending validation addressed to `delegate_pid`.
    #[must_use]
    pub fn next_validation_for(&self, delegate_pid: u32) -> Option<&Transaction> {
        self.rows
            .iter()
            .find(|txn| txn.kind == NotifyKind::Validated && txn.delegate_pid == delegate_pid)
    }

    /// Removes every transaction of `kind` for `handle`, returning them.
    ///
    /// Used when a `set` answers all outstanding computed reads of a
    /// variable at once.
    pub fn take_for_handle(&mut self, handle: Handle, kind: NotifyKind) -> Vec<Transaction> {
        let mut taken = Vec::new();
        let mut idx = 0;
        while idx < self.rows.len() {
            if self.rows[idx].handle == handle && self.rows[idx].kind == kind {
                taken.push(self.rows.remove(idx));
            } else {
                idx += 1;
            }
        }
        taken
    }

    /// Number of open transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` when no transaction is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A requester parked awaiting a delegate's completion.
#[derive(Debug)]
pub struct BlockedClient {
    /// The notification kind being waited on.
    pub kind: NotifyKind,
    /// The variable being waited on.
    pub handle: Handle,
    /// The waiting client.
    pub client: ClientId,
    reply: oneshot::Sender<Response>,
}

/// Clients parked pending a delegate's answer, keyed by
/// (variable, notification kind).
///
/// Backed by a `VecDeque` whose buffer is retained across block/release
/// cycles, so steady-state operation does not allocate.
#[derive(Debug, Default)]
pub struct BlockedRequestQueue {
    entries: VecDeque<BlockedClient>,
}

impl BlockedRequestQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a client's reply slot.
    pub fn block(
        &mut self,
        client: ClientId,
        kind: NotifyKind,
        handle: Handle,
        reply: oneshot::Sender<Response>,
    ) {
        self.entries.push_back(BlockedClient {
            kind,
            handle,
            client,
            reply,
        });
    }

    /// Releases every client blocked on (`handle`, `kind`), completing
    /// each with the response produced by `completion`.
    ///
    /// Returns the number of clients released. The caller invokes this
    /// exactly once per completed delegated value; a release for a pair
    /// with no waiters is a no-op.
    pub fn release(
        &mut self,
        handle: Handle,
        kind: NotifyKind,
        mut completion: impl FnMut(&BlockedClient) -> Response,
    ) -> Vec<ClientId> {
        let mut released = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.entries.len());
        while let Some(entry) = self.entries.pop_front() {
            if entry.handle == handle && entry.kind == kind {
                let response = completion(&entry);
                released.push(entry.client);
                // The waiter may have died; a dropped receiver is fine.
                let _ = entry.reply.send(response);
            } else {
                remaining.push_back(entry);
            }
        }
        self.entries = remaining;
        released
    }

    /// Drops every entry owned by a disconnecting client. Their reply
    /// slots are dead; nothing is sent.
    pub fn drop_for_client(&mut self, client: ClientId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.client != client);
        before - self.entries.len()
    }

    /// Number of parked clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nobody is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
