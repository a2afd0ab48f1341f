//! Request dispatcher.
//!
//! Every request is validated for a matching protocol id/version, then
//! routed through an ordinal-indexed handler table; unknown codes resolve
//! to the invalid handler. A handler either completes its response
//! immediately or defers by parking the reply slot (blocked-request queue
//! for computed/rendered waiters, the writer's registration for pending
//! validations); deferral is the only suspension point in the server.
//!
//! # Delegation Flow
//!
//! ```text
//! requester          dispatcher                 delegate
//!    │ get/set/print     │                          │
//!    ├──────────────────▶│ open transaction         │
//!    │                   ├─ Signal push ───────────▶│
//!    │   (reply parked)  │                          │
//!    │                   │◀──── answer request ─────┤
//!    │◀── parked reply ──┤ take transaction         │
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use varbus_core::config::MAX_WORKBUF;
use varbus_core::wire::{
    MAX_NAME_LEN, OpenPayload, QueryDescriptor, VarDescriptor, decode_value, get_string,
    put_string, value_bytes,
};
use varbus_core::{
    Frame, FrameHeader, Handle, NotifyKind, RequestCode, StatusCode, VarFlags,
};

use crate::delegate::TxnPayload;
use crate::events::{ConnId, PeerIdentity, PushFrame, Response, ServerEvent, TransportKind};
use crate::registry::ClientId;
use crate::state::ServerContext;
use crate::store::query::QueryHit;
use crate::sweeper;

/// How a handler finished.
pub enum Disposition {
    /// Complete now with this response.
    Respond(Response),
    /// The reply slot was parked; a later event completes it.
    Deferred,
}

/// Everything a handler may touch about one request.
pub struct RequestEnv {
    /// Originating connection.
    pub conn: ConnId,
    /// Transport the connection arrived on.
    pub transport: TransportKind,
    /// Kernel-verified peer identity (local transport only).
    pub peer: Option<PeerIdentity>,
    /// The request header.
    pub header: FrameHeader,
    /// The request payload.
    pub payload: Bytes,
    /// Descriptor received alongside the frame.
    pub fd: Option<std::os::fd::OwnedFd>,
    reply: Option<oneshot::Sender<Response>>,
}

impl RequestEnv {
    fn take_reply(&mut self) -> Option<oneshot::Sender<Response>> {
        self.reply.take()
    }
}

/// Applies one server event to the context.
pub fn handle_event(ctx: &mut ServerContext, event: ServerEvent) {
    match event {
        ServerEvent::Request {
            conn,
            transport,
            peer,
            frame,
            fd,
            reply,
        } => {
            let mut env = RequestEnv {
                conn,
                transport,
                peer,
                header: frame.header,
                payload: frame.payload,
                fd,
                reply: Some(reply),
            };
            dispatch_request(ctx, &mut env);
        }
        ServerEvent::NotifyAttach {
            conn,
            peer,
            frame,
            chan,
            reply,
        } => attach_notify(ctx, conn, peer, &frame, chan, reply),
        ServerEvent::Disconnected { conn } => ctx.drop_conn(conn),
    }
}

fn dispatch_request(ctx: &mut ServerContext, env: &mut RequestEnv) {
    let label = RequestCode::from_wire(env.header.code).map_or("invalid", RequestCode::name);

    // A mismatched protocol id/version rejects this request only; the
    // connection (and any other client state) is untouched.
    if !env.header.is_compatible() {
        warn!(
            conn = env.conn,
            protocol_id = env.header.protocol_id,
            version = env.header.version,
            "rejecting request with mismatched protocol id/version"
        );
        finish(ctx, env, label, Response::status(StatusCode::InvalidArgument));
        return;
    }

    match handler_for(env.header.code)(ctx, env) {
        Disposition::Respond(resp) => finish(ctx, env, label, resp),
        Disposition::Deferred => {
            ctx.metrics
                .request_completed(label, StatusCode::InProgress.name());
        }
    }
}

fn finish(ctx: &ServerContext, env: &mut RequestEnv, label: &str, resp: Response) {
    ctx.metrics.request_completed(label, resp.status.name());
    if let Some(reply) = env.take_reply() {
        let _ = reply.send(resp);
    }
}

type Handler = fn(&mut ServerContext, &mut RequestEnv) -> Disposition;

/// Ordinal-indexed handler table; entry `i` serves request code `i + 1`.
const HANDLERS: [Handler; 21] = [
    handle_open,
    handle_close,
    handle_echo,
    handle_create,
    handle_find,
    handle_get,
    handle_print,
    handle_set,
    handle_get_type,
    handle_get_name,
    handle_get_length,
    handle_subscribe,
    handle_unsubscribe,
    handle_get_pending_validation,
    handle_send_validation_response,
    handle_open_render_session,
    handle_close_render_session,
    handle_query_first,
    handle_query_next,
    handle_set_flags,
    handle_clear_flags,
];

fn handler_for(code: u16) -> Handler {
    match RequestCode::from_wire(code) {
        Some(code) => HANDLERS[(code.wire() - 1) as usize],
        None => handle_invalid,
    }
}

fn status(code: StatusCode) -> Disposition {
    Disposition::Respond(Response::status(code))
}

/// Resolves the client bound to the request connection.
fn bound_client(ctx: &ServerContext, env: &RequestEnv) -> Result<ClientId, StatusCode> {
    ctx.client_for_conn(env.conn)
        .ok_or(StatusCode::InvalidArgument)
}

/// Resolves the bound client's (id, pid, gid).
fn bound_identity(
    ctx: &ServerContext,
    env: &RequestEnv,
) -> Result<(ClientId, u32, u32), StatusCode> {
    let client = bound_client(ctx, env)?;
    ctx.registry
        .get(client)
        .map(|reg| (client, reg.pid, reg.gid))
        .ok_or(StatusCode::InvalidArgument)
}

// ============================================================================
// Session handlers
// ============================================================================

fn handle_open(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    if ctx.bindings.contains_key(&env.conn) {
        return status(StatusCode::InvalidArgument);
    }
    let workbuf = match env.header.param2 as usize {
        0 => ctx.config.default_workbuf,
        n => n.min(MAX_WORKBUF),
    };
    let Some((pid, gid)) = open_identity(env) else {
        return status(StatusCode::InvalidArgument);
    };
    match ctx.registry.connect(pid, gid, env.transport, workbuf) {
        Ok(id) => {
            ctx.bindings.insert(env.conn, id);
            ctx.metrics.set_clients(ctx.registry.live_count());
            info!(
                client = id,
                pid,
                transport = env.transport.name(),
                workbuf,
                "client registered"
            );
            Disposition::Respond(Response::params(id, 0))
        }
        Err(code) => status(code),
    }
}

/// Peer identity for an `open`: kernel credentials on the local
/// transport, the claimed payload on TCP.
fn open_identity(env: &RequestEnv) -> Option<(u32, u32)> {
    if let Some(peer) = env.peer {
        return Some((peer.pid, peer.gid));
    }
    let mut payload = env.payload.clone();
    OpenPayload::decode(&mut payload)
        .ok()
        .map(|open| (open.pid, open.gid))
}

fn handle_close(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    let Ok(client) = bound_client(ctx, env) else {
        return status(StatusCode::InvalidArgument);
    };
    debug!(client, "client closed");
    ctx.drop_client(client);
    status(StatusCode::Ok)
}

fn handle_echo(_ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    Disposition::Respond(Response::payload(env.payload.clone()))
}

fn handle_invalid(_ctx: &mut ServerContext, _env: &mut RequestEnv) -> Disposition {
    status(StatusCode::NotSupported)
}

// ============================================================================
// Store handlers
// ============================================================================

fn handle_create(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    let (client, _, _) = match bound_identity(ctx, env) {
        Ok(identity) => identity,
        Err(code) => return status(code),
    };
    let mut payload = env.payload.clone();
    let Ok(desc) = VarDescriptor::decode(&mut payload) else {
        return status(StatusCode::InvalidArgument);
    };
    // The working buffer caps what this client may marshal.
    let workbuf = ctx
        .registry
        .get(client)
        .map_or(0, crate::registry::ClientRegistration::workbuf_capacity);
    if desc.value.len() > workbuf {
        return status(StatusCode::TooBig);
    }
    match ctx.store.add(&desc) {
        Ok(handle) => {
            ctx.metrics.set_variables(ctx.store.len());
            let guid = ctx.store.get(handle).map_or(0, |var| var.guid);
            debug!(name = %desc.name, instance = desc.instance, handle, "variable created");
            Disposition::Respond(Response::params(handle, guid))
        }
        Err(code) => status(code),
    }
}

fn handle_find(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    if bound_client(ctx, env).is_err() {
        return status(StatusCode::InvalidArgument);
    }
    let mut payload = env.payload.clone();
    let Ok(name) = get_string(&mut payload, MAX_NAME_LEN) else {
        return status(StatusCode::InvalidArgument);
    };
    if payload.remaining() < 4 {
        return status(StatusCode::InvalidArgument);
    }
    let instance = payload.get_u32();
    match ctx.store.find(&name, instance) {
        Ok(handle) => Disposition::Respond(Response::params(handle, 0)),
        Err(code) => status(code),
    }
}

fn handle_get(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    let (client, pid, gid) = match bound_identity(ctx, env) {
        Ok(identity) => identity,
        Err(code) => return status(code),
    };
    let handle = env.header.param1;
    let (delegate, payload) = match ctx.store.get(handle) {
        Some(var) => {
            if !var.readable_by(gid) {
                return status(StatusCode::PermissionDenied);
            }
            (var.notify.delegate(NotifyKind::Computed), value_bytes(&var.value))
        }
        None => return status(StatusCode::NotFound),
    };
    // A computed variable is serviced by its delegate, unless the
    // delegate itself is reading, which must see the stored value to
    // avoid a self-deadlock loop.
    if let Some(delegate_pid) = delegate {
        if delegate_pid != pid {
            return delegate_request(
                ctx,
                env,
                client,
                pid,
                delegate_pid,
                NotifyKind::Computed,
                handle,
                TxnPayload::Computed,
            );
        }
    }
    Disposition::Respond(Response::payload(payload))
}

fn handle_set(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    let (client, pid, gid) = match bound_identity(ctx, env) {
        Ok(identity) => identity,
        Err(code) => return status(code),
    };
    let handle = env.header.param1;
    let mut payload = env.payload.clone();
    let Ok(value) = decode_value(&mut payload) else {
        return status(StatusCode::InvalidArgument);
    };
    let (writable, delegate) = match ctx.store.get(handle) {
        Some(var) => {
            let computed_delegate = var.notify.delegate(NotifyKind::Computed);
            let read_only_ok =
                !var.flags.contains(VarFlags::READ_ONLY) || computed_delegate == Some(pid);
            (
                var.writable_by(gid) && read_only_ok,
                var.notify.delegate(NotifyKind::Validated),
            )
        }
        None => return status(StatusCode::NotFound),
    };
    if !writable {
        return status(StatusCode::PermissionDenied);
    }
    if let Some(delegate_pid) = delegate {
        if delegate_pid != pid {
            // Validation is exclusive per variable and per writer.
            if ctx.txns.has_validation_for(handle) {
                return status(StatusCode::InProgress);
            }
            if ctx
                .registry
                .get(client)
                .is_some_and(|reg| reg.validation.is_some())
            {
                return status(StatusCode::InProgress);
            }
            return delegate_request(
                ctx,
                env,
                client,
                pid,
                delegate_pid,
                NotifyKind::Validated,
                handle,
                TxnPayload::Validation {
                    proposed: value,
                    writer: client,
                },
            );
        }
    }
    status(apply_set(ctx, handle, value))
}

fn handle_print(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    let (client, pid, gid) = match bound_identity(ctx, env) {
        Ok(identity) => identity,
        Err(code) => return status(code),
    };
    let handle = env.header.param1;
    let (delegate, text) = match ctx.store.get(handle) {
        Some(var) => {
            if !var.readable_by(gid) {
                return status(StatusCode::PermissionDenied);
            }
            (var.notify.delegate(NotifyKind::Rendered), var.render())
        }
        None => return status(StatusCode::NotFound),
    };
    if let Some(delegate_pid) = delegate {
        if delegate_pid != pid {
            // The render hand-off moves a descriptor; it cannot cross TCP.
            if env.transport != TransportKind::Local {
                return status(StatusCode::NotSupported);
            }
            let Some(fd) = env.fd.take() else {
                return status(StatusCode::InvalidArgument);
            };
            return delegate_request(
                ctx,
                env,
                client,
                pid,
                delegate_pid,
                NotifyKind::Rendered,
                handle,
                TxnPayload::Render {
                    fd: Some(fd),
                    opened: false,
                },
            );
        }
    }
    Disposition::Respond(Response::payload(Bytes::from(text)))
}

fn handle_get_type(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    if bound_client(ctx, env).is_err() {
        return status(StatusCode::InvalidArgument);
    }
    match ctx.store.get(env.header.param1) {
        Some(var) => Disposition::Respond(Response::params(
            u32::from(var.value.var_type().tag()),
            u32::from(var.flags.bits()),
        )),
        None => status(StatusCode::NotFound),
    }
}

fn handle_get_name(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    if bound_client(ctx, env).is_err() {
        return status(StatusCode::InvalidArgument);
    }
    match ctx.store.get(env.header.param1) {
        Some(var) => {
            let mut resp = Response::payload(Bytes::copy_from_slice(var.name.as_bytes()));
            resp.param1 = var.instance;
            Disposition::Respond(resp)
        }
        None => status(StatusCode::NotFound),
    }
}

fn handle_get_length(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    if bound_client(ctx, env).is_err() {
        return status(StatusCode::InvalidArgument);
    }
    match ctx.store.get(env.header.param1) {
        Some(var) => Disposition::Respond(Response::params(
            var.value.len() as u32,
            var.capacity as u32,
        )),
        None => status(StatusCode::NotFound),
    }
}

fn handle_set_flags(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    mutate_flags(ctx, env, |flags, bits| flags.insert(bits))
}

fn handle_clear_flags(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    mutate_flags(ctx, env, |flags, bits| flags.remove(bits))
}

fn mutate_flags(
    ctx: &mut ServerContext,
    env: &mut RequestEnv,
    apply: fn(&mut VarFlags, VarFlags),
) -> Disposition {
    let (_, _, gid) = match bound_identity(ctx, env) {
        Ok(identity) => identity,
        Err(code) => return status(code),
    };
    #[allow(clippy::cast_possible_truncation)]
    let bits = VarFlags::from_bits_truncate(env.header.param2 as u16);
    match ctx.store.get_mut(env.header.param1) {
        Some(var) => {
            if !var.writable_by(gid) {
                return status(StatusCode::PermissionDenied);
            }
            apply(&mut var.flags, bits);
            status(StatusCode::Ok)
        }
        None => status(StatusCode::NotFound),
    }
}

// ============================================================================
// Notification handlers
// ============================================================================

fn handle_subscribe(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    subscription(ctx, env, |var, kind, pid| var.notify.register(kind, pid))
}

fn handle_unsubscribe(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    subscription(ctx, env, |var, kind, pid| var.notify.unregister(kind, pid))
}

fn subscription(
    ctx: &mut ServerContext,
    env: &mut RequestEnv,
    apply: fn(&mut crate::store::Variable, NotifyKind, u32) -> Result<(), StatusCode>,
) -> Disposition {
    let (_, pid, _) = match bound_identity(ctx, env) {
        Ok(identity) => identity,
        Err(code) => return status(code),
    };
    let Some(kind) = NotifyKind::from_wire(env.header.param2) else {
        return status(StatusCode::InvalidArgument);
    };
    match ctx.store.get_mut(env.header.param1) {
        Some(var) => match apply(var, kind, pid) {
            Ok(()) => status(StatusCode::Ok),
            Err(code) => status(code),
        },
        None => status(StatusCode::NotFound),
    }
}

// ============================================================================
// Query handlers
// ============================================================================

fn handle_query_first(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    let (_, pid, _) = match bound_identity(ctx, env) {
        Ok(identity) => identity,
        Err(code) => return status(code),
    };
    let mut payload = env.payload.clone();
    let Ok(desc) = QueryDescriptor::decode(&mut payload) else {
        return status(StatusCode::InvalidArgument);
    };
    match ctx.store.query_first(pid, &desc) {
        Ok(hit) => Disposition::Respond(query_hit_response(&hit)),
        Err(code) => status(code),
    }
}

fn handle_query_next(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    let (_, pid, _) = match bound_identity(ctx, env) {
        Ok(identity) => identity,
        Err(code) => return status(code),
    };
    match ctx.store.query_next(pid, env.header.param1) {
        Ok(hit) => Disposition::Respond(query_hit_response(&hit)),
        Err(code) => status(code),
    }
}

fn query_hit_response(hit: &QueryHit) -> Response {
    let mut payload = BytesMut::with_capacity(hit.name.len() + 6);
    put_string(&mut payload, &hit.name);
    payload.put_u32(hit.instance);
    let mut resp = Response::payload(payload.freeze());
    resp.param1 = hit.context;
    resp.param2 = hit.handle;
    resp
}

// ============================================================================
// Delegation handlers
// ============================================================================

fn handle_get_pending_validation(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    let (_, pid, _) = match bound_identity(ctx, env) {
        Ok(identity) => identity,
        Err(code) => return status(code),
    };
    match ctx.txns.next_validation_for(pid) {
        Some(txn) => {
            let TxnPayload::Validation { proposed, .. } = &txn.payload else {
                return status(StatusCode::NotFound);
            };
            let mut resp = Response::payload(value_bytes(proposed));
            resp.param1 = txn.id;
            resp.param2 = txn.handle;
            Disposition::Respond(resp)
        }
        None => status(StatusCode::NotFound),
    }
}

fn handle_send_validation_response(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    let (_, pid, _) = match bound_identity(ctx, env) {
        Ok(identity) => identity,
        Err(code) => return status(code),
    };
    #[allow(clippy::cast_possible_truncation)]
    let Some(verdict) = StatusCode::from_wire(env.header.param2 as u16) else {
        return status(StatusCode::InvalidArgument);
    };
    let txn_id = env.header.param1;
    let known = ctx
        .txns
        .get(txn_id)
        .is_some_and(|txn| txn.kind == NotifyKind::Validated && txn.delegate_pid == pid);
    if !known {
        return status(StatusCode::NotFound);
    }
    let Some(txn) = ctx.txns.take(txn_id) else {
        return status(StatusCode::NotFound);
    };
    ctx.metrics.transaction_closed();
    let TxnPayload::Validation { proposed, writer } = txn.payload else {
        return status(StatusCode::NotFound);
    };
    // Retrieve the writer's held-open reply before touching the store;
    // the writer may have disconnected, in which case the result is
    // simply dropped.
    let reply = ctx.registry.get_mut(writer).and_then(|reg| {
        reg.validation = None;
        reg.validation_reply.take()
    });
    let result = if verdict == StatusCode::Ok {
        // Accepted: re-apply the original write on the writer's behalf.
        apply_set(ctx, txn.handle, proposed)
    } else {
        verdict
    };
    debug!(txn = txn_id, handle = txn.handle, result = result.name(), "validation resolved");
    if let Some(reply) = reply {
        let _ = reply.send(Response::status(result));
    }
    status(StatusCode::Ok)
}

fn handle_open_render_session(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    let (_, pid, _) = match bound_identity(ctx, env) {
        Ok(identity) => identity,
        Err(code) => return status(code),
    };
    // The session hands a descriptor to the delegate, so the delegate
    // must also sit on the local transport.
    if env.transport != TransportKind::Local {
        return status(StatusCode::NotSupported);
    }
    let txn_id = env.header.param1;
    let Some(txn) = ctx.txns.get_mut(txn_id) else {
        return status(StatusCode::NotFound);
    };
    if txn.kind != NotifyKind::Rendered || txn.delegate_pid != pid {
        return status(StatusCode::NotFound);
    }
    let TxnPayload::Render { fd, opened } = &mut txn.payload else {
        return status(StatusCode::NotFound);
    };
    if *opened {
        return status(StatusCode::NotSupported);
    }
    let Some(fd) = fd.take() else {
        return status(StatusCode::InvalidArgument);
    };
    *opened = true;
    let mut resp = Response::params(txn_id, txn.handle);
    resp.fd = Some(fd);
    Disposition::Respond(resp)
}

fn handle_close_render_session(ctx: &mut ServerContext, env: &mut RequestEnv) -> Disposition {
    let (_, pid, _) = match bound_identity(ctx, env) {
        Ok(identity) => identity,
        Err(code) => return status(code),
    };
    let txn_id = env.header.param1;
    let known = ctx.txns.get(txn_id).is_some_and(|txn| {
        txn.kind == NotifyKind::Rendered
            && txn.delegate_pid == pid
            && matches!(txn.payload, TxnPayload::Render { opened: true, .. })
    });
    if !known {
        return status(StatusCode::NotFound);
    }
    let Some(txn) = ctx.txns.take(txn_id) else {
        return status(StatusCode::NotFound);
    };
    ctx.metrics.transaction_closed();
    // The requester's output already carries the rendered bytes; release
    // it with the out-of-band marker.
    let released = ctx.blocked.release(txn.handle, NotifyKind::Rendered, |_| {
        Response::status(StatusCode::StreamedElsewhere)
    });
    unblock(ctx, &released);
    status(StatusCode::Ok)
}

/// Opens a transaction, signals the delegate, and parks the requester.
///
/// On delivery failure the transaction is rolled back, the subscription
/// demoted, and the requester answered with `DelegateGone`.
#[allow(clippy::too_many_arguments)]
fn delegate_request(
    ctx: &mut ServerContext,
    env: &mut RequestEnv,
    client: ClientId,
    origin_pid: u32,
    delegate_pid: u32,
    kind: NotifyKind,
    handle: Handle,
    payload: TxnPayload,
) -> Disposition {
    let txn_id = ctx.txns.open(kind, handle, delegate_pid, origin_pid, payload);
    ctx.metrics.transaction_opened();
    if !deliver_signal(ctx, delegate_pid, kind, handle, txn_id) {
        ctx.txns.take(txn_id);
        ctx.metrics.transaction_closed();
        return status(StatusCode::DelegateGone);
    }
    let Some(reply) = env.take_reply() else {
        return Disposition::Deferred;
    };
    match kind {
        NotifyKind::Computed | NotifyKind::Rendered => {
            ctx.blocked.block(client, kind, handle, reply);
            if let Some(reg) = ctx.registry.get_mut(client) {
                reg.blocked = true;
            }
        }
        NotifyKind::Validated => {
            // Validated writers are not queued; the reply is held open on
            // the registration until the validator answers.
            if let Some(reg) = ctx.registry.get_mut(client) {
                reg.validation = Some(txn_id);
                reg.validation_reply = Some(reply);
            }
        }
        NotifyKind::Modified => unreachable!("modified is never delegated"),
    }
    Disposition::Deferred
}

/// Pushes a delegation signal to a delegate's notify channel.
///
/// A failed delivery (no registration, no live channel, or a dead
/// process) demotes the subscription lazily and reports `false`; clients
/// already blocked on this delegate are not released.
fn deliver_signal(
    ctx: &mut ServerContext,
    delegate_pid: u32,
    kind: NotifyKind,
    handle: Handle,
    txn_id: u32,
) -> bool {
    let chan = ctx
        .registry
        .find_by_pid(delegate_pid)
        .and_then(|reg| reg.notify.clone());
    let sent = chan.is_some_and(|chan| {
        chan.try_send(PushFrame::Signal {
            kind,
            handle,
            txn_id,
        })
        .is_ok()
    });
    if sent {
        ctx.metrics.notification_sent(kind.name());
        return true;
    }
    let liveness = sweeper::probe(delegate_pid);
    warn!(
        delegate = delegate_pid,
        kind = kind.name(),
        ?liveness,
        "delegate signal delivery failed; demoting subscription"
    );
    if let Some(var) = ctx.store.get_mut(handle) {
        var.notify.demote(kind, delegate_pid);
    }
    ctx.metrics.delivery_failed(kind.name());
    false
}

/// Applies a write and runs its completion side effects: computed
/// waiters are answered and `modified` subscribers notified. Idempotent
/// writes skip both.
fn apply_set(ctx: &mut ServerContext, handle: Handle, value: varbus_core::VarValue) -> StatusCode {
    use crate::store::WriteOutcome;
    match ctx.store.apply_write(handle, value) {
        Ok(WriteOutcome::Applied) => {
            complete_computed(ctx, handle);
            fanout_modified(ctx, handle);
            StatusCode::Ok
        }
        Ok(WriteOutcome::Unchanged) => StatusCode::AlreadyCurrent,
        Err(code) => code,
    }
}

/// Releases every reader blocked on a computed result for `handle` with
/// the freshly stored value, closing the answered transactions.
fn complete_computed(ctx: &mut ServerContext, handle: Handle) {
    let answered = ctx.txns.take_for_handle(handle, NotifyKind::Computed);
    for _ in &answered {
        ctx.metrics.transaction_closed();
    }
    let Some(payload) = ctx.store.get(handle).map(|var| value_bytes(&var.value)) else {
        return;
    };
    let released = ctx
        .blocked
        .release(handle, NotifyKind::Computed, |_| Response::payload(payload.clone()));
    unblock(ctx, &released);
}

fn unblock(ctx: &mut ServerContext, clients: &[ClientId]) {
    for client in clients {
        if let Some(reg) = ctx.registry.get_mut(*client) {
            reg.blocked = false;
        }
    }
}

/// Fans out a `modified` push to every subscriber of `handle`. Delivery
/// failures demote the subscription lazily.
fn fanout_modified(ctx: &mut ServerContext, handle: Handle) {
    let Some((pids, value)) = ctx
        .store
        .get(handle)
        .map(|var| (var.notify.modified_pids(), var.value.clone()))
    else {
        return;
    };
    let mut gone = Vec::new();
    for pid in pids {
        let chan = ctx.registry.find_by_pid(pid).and_then(|reg| reg.notify.clone());
        let sent = chan.is_some_and(|chan| {
            chan.try_send(PushFrame::Modified {
                handle,
                value: value.clone(),
            })
            .is_ok()
        });
        if sent {
            ctx.metrics.notification_sent(NotifyKind::Modified.name());
        } else {
            gone.push(pid);
        }
    }
    for pid in gone {
        warn!(subscriber = pid, handle, "modified push undeliverable; demoting subscription");
        if let Some(var) = ctx.store.get_mut(handle) {
            var.notify.demote(NotifyKind::Modified, pid);
        }
        ctx.metrics.delivery_failed(NotifyKind::Modified.name());
    }
}

// ============================================================================
// Notify channel attachment
// ============================================================================

/// Attaches a connection as its client's push channel.
///
/// The client must already hold a registration (the notify channel is
/// established out of band, after the request connection's `open`).
fn attach_notify(
    ctx: &mut ServerContext,
    conn: ConnId,
    peer: Option<PeerIdentity>,
    frame: &Frame,
    chan: mpsc::Sender<PushFrame>,
    reply: oneshot::Sender<Response>,
) {
    let pid = peer.map(|peer| peer.pid).or_else(|| {
        let mut payload = frame.payload.clone();
        OpenPayload::decode(&mut payload).ok().map(|open| open.pid)
    });
    let resp = match pid {
        None => Response::status(StatusCode::InvalidArgument),
        Some(pid) => {
            let attached = ctx.registry.find_by_pid(pid).map(|reg| {
                reg.notify = Some(chan);
                reg.id
            });
            match attached {
                Some(client) => {
                    ctx.notify_bindings.insert(conn, client);
                    debug!(client, pid, conn, "notify channel attached");
                    Response::params(client, 0)
                }
                None => Response::status(StatusCode::NotFound),
            }
        }
    };
    ctx.metrics
        .request_completed(RequestCode::Open.name(), resp.status.name());
    let _ = reply.send(resp);
}
