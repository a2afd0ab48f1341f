//! The variable store: a fixed-capacity table of variables keyed by a
//! stable 1-based handle.
//!
//! The store owns each variable's typed value, flags, tags, permissions,
//! and notification set, and exposes create/find/get/write plus the
//! query/cursor engine. Variables are never individually deleted; their
//! lifetime is the lifetime of the server. Delegation (computed,
//! validated, rendered) lives above the store, in the dispatcher: the
//! store's writes are plain storage operations.

mod notify;
pub mod query;
mod tags;

pub use notify::{ModifiedSub, NotificationSet};
pub use tags::{MAX_REGISTRY_TAGS, TagId, TagRegistry};

use tracing::info;
use varbus_core::wire::VarDescriptor;
use varbus_core::{Handle, StatusCode, VarFlags, VarType, VarValue};

use self::query::{CompiledQuery, QueryHit, SearchTable};
use varbus_core::wire::QueryDescriptor;

/// One stored variable.
#[derive(Debug)]
pub struct Variable {
    /// Stable 1-based handle.
    pub handle: Handle,
    /// Name; unique together with `instance` (case-insensitive).
    pub name: String,
    /// Instance identifier.
    pub instance: u32,
    /// Globally-unique id, assigned at creation.
    pub guid: u32,
    /// Current value. The variant never changes after creation.
    pub value: VarValue,
    /// Fixed capacity in bytes for string/blob variables.
    pub capacity: usize,
    /// Flag bitmask.
    pub flags: VarFlags,
    /// Interned tag ids.
    pub tags: Vec<TagId>,
    /// Format specifier used by `print`.
    pub format: String,
    /// Group ids permitted to read; empty means unrestricted.
    pub read_groups: Vec<u32>,
    /// Group ids permitted to write; empty means unrestricted.
    pub write_groups: Vec<u32>,
    /// Notification registrations.
    pub notify: NotificationSet,
}

impl Variable {
    /// Group-id read permission check. Group 0 is always permitted.
    #[must_use]
    pub fn readable_by(&self, gid: u32) -> bool {
        gid == 0 || self.read_groups.is_empty() || self.read_groups.contains(&gid)
    }

    /// Group-id write permission check. Group 0 is always permitted.
    #[must_use]
    pub fn writable_by(&self, gid: u32) -> bool {
        gid == 0 || self.write_groups.is_empty() || self.write_groups.contains(&gid)
    }

    /// Renders the value through the variable's format specifier.
    ///
    /// Password-flagged variables render masked.
    #[must_use]
    pub fn render(&self) -> String {
        if self.flags.contains(VarFlags::PASSWORD) {
            return "********".to_string();
        }
        self.value.render(&self.format)
    }
}

/// Result of an applied write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The stored value changed.
    Applied,
    /// The write was byte-identical to the stored value; fan-out is
    /// suppressed and the caller reports `AlreadyCurrent`.
    Unchanged,
}

/// Fixed-capacity variable table plus the tag registry and the query
/// cursor table.
pub struct VariableStore {
    vars: Vec<Variable>,
    capacity: usize,
    next_guid: u32,
    /// Tag interner shared by creation and queries.
    pub tags: TagRegistry,
    queries: SearchTable,
}

impl VariableStore {
    /// Creates a store with a fixed variable capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            vars: Vec::new(),
            capacity,
            next_guid: 1,
            tags: TagRegistry::new(),
            queries: SearchTable::new(),
        }
    }

    /// Number of stored variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns `true` when the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Creates a variable from a descriptor, returning its handle.
    ///
    /// Re-creating an existing (name, instance) pair returns the existing
    /// handle: at most one handle exists per pair.
    ///
    /// # Errors
    ///
    /// [`StatusCode::NotSupported`] for a zero-length string/blob
    /// definition, [`StatusCode::OutOfMemory`] when the table (or the tag
    /// registry) is exhausted.
    pub fn add(&mut self, desc: &VarDescriptor) -> Result<Handle, StatusCode> {
        if desc.value.is_empty() {
            return Err(StatusCode::NotSupported);
        }
        if let Ok(existing) = self.find(&desc.name, desc.instance) {
            return Ok(existing);
        }
        if self.vars.len() >= self.capacity {
            return Err(StatusCode::OutOfMemory);
        }
        let mut tag_ids = Vec::with_capacity(desc.tags.len());
        for tag in &desc.tags {
            tag_ids.push(self.tags.register(tag)?);
        }
        let handle = (self.vars.len() + 1) as Handle;
        let guid = self.next_guid;
        self.next_guid += 1;
        self.vars.push(Variable {
            handle,
            name: desc.name.clone(),
            instance: desc.instance,
            guid,
            capacity: desc.value.len(),
            value: desc.value.clone(),
            flags: VarFlags::from_bits_truncate(desc.flags),
            tags: tag_ids,
            format: desc.format.clone(),
            read_groups: desc.read_groups.clone(),
            write_groups: desc.write_groups.clone(),
            notify: NotificationSet::new(),
        });
        Ok(handle)
    }

    /// Looks up a handle by (name, instance), case-insensitively.
    ///
    /// # Errors
    ///
    /// [`StatusCode::NotFound`] when absent.
    pub fn find(&self, name: &str, instance: u32) -> Result<Handle, StatusCode> {
        self.vars
            .iter()
            .find(|var| var.instance == instance && var.name.eq_ignore_ascii_case(name))
            .map(|var| var.handle)
            .ok_or(StatusCode::NotFound)
    }

    /// Borrows a variable by handle.
    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<&Variable> {
        self.vars.get(handle.checked_sub(1)? as usize)
    }

    /// Borrows a variable mutably by handle.
    #[must_use]
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Variable> {
        self.vars.get_mut(handle.checked_sub(1)? as usize)
    }

    /// Applies a write to a variable's stored value.
    ///
    /// The incoming value is coerced into the variable's type with range
    /// checking; a byte-identical write is reported as
    /// [`WriteOutcome::Unchanged`] without touching the store. A changing
    /// write sets the dirty flag, and audited variables log the write.
    ///
    /// # Errors
    ///
    /// [`StatusCode::NotFound`] for an unknown handle,
    /// [`StatusCode::OutOfRange`]/[`StatusCode::NotSupported`] from
    /// coercion, [`StatusCode::TooBig`] when a string/blob exceeds the
    /// fixed capacity.
    pub fn apply_write(&mut self, handle: Handle, value: VarValue) -> Result<WriteOutcome, StatusCode> {
        let var = self
            .vars
            .get_mut((handle.checked_sub(1).ok_or(StatusCode::NotFound)?) as usize)
            .ok_or(StatusCode::NotFound)?;
        let coerced = value.coerce_into(var.value.var_type())?;
        if matches!(var.value.var_type(), VarType::Str | VarType::Blob)
            && coerced.len() > var.capacity
        {
            return Err(StatusCode::TooBig);
        }
        if coerced.same_bytes(&var.value) {
            return Ok(WriteOutcome::Unchanged);
        }
        var.value = coerced;
        var.flags.insert(VarFlags::DIRTY);
        if var.flags.contains(VarFlags::AUDITED) {
            info!(name = %var.name, instance = var.instance, handle, "audited variable written");
        }
        Ok(WriteOutcome::Applied)
    }

    /// Starts a query, returning the first hit and a cursor context.
    ///
    /// # Errors
    ///
    /// [`StatusCode::NotFound`] when nothing matches (no context is
    /// created), [`StatusCode::OutOfMemory`] when the context table is
    /// full.
    pub fn query_first(&mut self, owner_pid: u32, desc: &QueryDescriptor) -> Result<QueryHit, StatusCode> {
        let Some(compiled) = CompiledQuery::compile(&self.tags, desc) else {
            // A filter names an unknown tag: nothing can ever match.
            return Err(StatusCode::NotFound);
        };
        let first = Self::scan(&self.vars, &compiled, 0).ok_or(StatusCode::NotFound)?;
        let context = self.queries.create(owner_pid, compiled, first)?;
        let var = &self.vars[(first - 1) as usize];
        Ok(QueryHit {
            context,
            handle: first,
            name: var.name.clone(),
            instance: var.instance,
        })
    }

    /// Advances a query cursor.
    ///
    /// Exhaustion destroys the context and returns
    /// [`StatusCode::NotFound`]; advancing an unknown or expired context
    /// (or one owned by another client) returns
    /// [`StatusCode::NotSupported`].
    ///
    /// # Errors
    ///
    /// As described above.
    pub fn query_next(&mut self, owner_pid: u32, context: u32) -> Result<QueryHit, StatusCode> {
        let ctx = self
            .queries
            .get_mut(context, owner_pid)
            .ok_or(StatusCode::NotSupported)?;
        match Self::scan(&self.vars, ctx.query(), ctx.cursor()) {
            Some(handle) => {
                ctx.advance(handle);
                let var = &self.vars[(handle - 1) as usize];
                Ok(QueryHit {
                    context,
                    handle,
                    name: var.name.clone(),
                    instance: var.instance,
                })
            }
            None => {
                self.queries.destroy(context);
                Err(StatusCode::NotFound)
            }
        }
    }

    /// Destroys every cursor owned by `pid` (client disconnect).
    pub fn drop_contexts_for(&mut self, pid: u32) {
        self.queries.drop_for(pid);
    }

    /// Number of live query contexts.
    #[must_use]
    pub fn context_count(&self) -> usize {
        self.queries.len()
    }

    fn scan(vars: &[Variable], query: &CompiledQuery, after: Handle) -> Option<Handle> {
        vars.iter()
            .skip(after as usize)
            .find(|var| query.matches(var))
            .map(|var| var.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use varbus_core::wire::query;

    fn store() -> VariableStore {
        VariableStore::new(16)
    }

    fn descriptor(name: &str, instance: u32, value: VarValue) -> VarDescriptor {
        VarDescriptor::new(name, instance, value)
    }

    #[test]
    fn handles_are_dense_and_stable() {
        let mut store = store();
        let a = store.add(&descriptor("a", 0, VarValue::Int32(1))).unwrap();
        let b = store.add(&descriptor("b", 0, VarValue::Int32(2))).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(store.get(a).unwrap().name, "a");
        assert!(store.get(0).is_none());
        assert!(store.get(3).is_none());
    }

    #[test]
    fn name_instance_pair_is_unique() {
        let mut store = store();
        let a = store.add(&descriptor("Sensor", 1, VarValue::Int32(1))).unwrap();
        // Same pair (case-insensitive) yields the same handle.
        let b = store.add(&descriptor("sensor", 1, VarValue::Int32(9))).unwrap();
        assert_eq!(a, b);
        // The original value is untouched by the duplicate creation.
        assert_eq!(store.get(a).unwrap().value, VarValue::Int32(1));
        // A different instance is a different variable.
        let c = store.add(&descriptor("sensor", 2, VarValue::Int32(1))).unwrap();
        assert_ne!(a, c);
        assert_eq!(store.find("SENSOR", 2).unwrap(), c);
    }

    #[test]
    fn empty_string_definition_is_refused() {
        let mut store = store();
        assert_eq!(
            store.add(&descriptor("s", 0, VarValue::Str(String::new()))),
            Err(StatusCode::NotSupported)
        );
        assert_eq!(
            store.add(&descriptor("b", 0, VarValue::Blob(Vec::new()))),
            Err(StatusCode::NotSupported)
        );
    }

    #[test]
    fn table_capacity_is_fixed() {
        let mut store = VariableStore::new(2);
        store.add(&descriptor("a", 0, VarValue::Int16(0))).unwrap();
        store.add(&descriptor("b", 0, VarValue::Int16(0))).unwrap();
        assert_eq!(
            store.add(&descriptor("c", 0, VarValue::Int16(0))),
            Err(StatusCode::OutOfMemory)
        );
    }

    #[test]
    fn write_range_and_idempotency() {
        let mut store = store();
        let h = store.add(&descriptor("v", 0, VarValue::UInt16(0))).unwrap();

        // Wider source value out of the destination's range.
        assert_eq!(
            store.apply_write(h, VarValue::UInt32(70_000)),
            Err(StatusCode::OutOfRange)
        );
        // In-range write applies.
        assert_eq!(
            store.apply_write(h, VarValue::UInt32(42)),
            Ok(WriteOutcome::Applied)
        );
        assert_eq!(store.get(h).unwrap().value, VarValue::UInt16(42));
        assert!(store.get(h).unwrap().flags.contains(VarFlags::DIRTY));
        // Byte-identical write is reported unchanged.
        assert_eq!(
            store.apply_write(h, VarValue::UInt16(42)),
            Ok(WriteOutcome::Unchanged)
        );
    }

    #[test]
    fn string_capacity_is_fixed_at_creation() {
        let mut store = store();
        let h = store
            .add(&descriptor("s", 0, VarValue::Str("abcd".into())))
            .unwrap();
        assert_eq!(store.get(h).unwrap().capacity, 4);
        // Shorter writes fit; longer ones never do.
        assert_eq!(
            store.apply_write(h, VarValue::Str("xy".into())),
            Ok(WriteOutcome::Applied)
        );
        assert_eq!(
            store.apply_write(h, VarValue::Str("abcde".into())),
            Err(StatusCode::TooBig)
        );
        assert_eq!(
            store.apply_write(h, VarValue::Str("xy".into())),
            Ok(WriteOutcome::Unchanged)
        );
    }

    #[test]
    fn permissions_default_open() {
        let mut store = store();
        let mut desc = descriptor("p", 0, VarValue::Int32(0));
        desc.read_groups = vec![100];
        desc.write_groups = vec![100, 101];
        let h = store.add(&desc).unwrap();
        let var = store.get(h).unwrap();
        assert!(var.readable_by(100));
        assert!(!var.readable_by(101));
        assert!(var.readable_by(0)); // group 0 bypasses
        assert!(var.writable_by(101));
        assert!(!var.writable_by(102));

        let open = store.add(&descriptor("q", 0, VarValue::Int32(0))).unwrap();
        assert!(store.get(open).unwrap().readable_by(12345));
    }

    #[test]
    fn hidden_variables_never_match_queries() {
        let mut store = store();
        let mut desc = descriptor("secret.temp", 0, VarValue::Int32(1));
        desc.flags = VarFlags::HIDDEN.bits();
        store.add(&desc).unwrap();
        store.add(&descriptor("public.temp", 0, VarValue::Int32(1))).unwrap();

        let q = QueryDescriptor {
            predicates: query::MATCH,
            match_text: "temp".into(),
            ..QueryDescriptor::default()
        };
        let hit = store.query_first(1, &q).unwrap();
        assert_eq!(hit.name, "public.temp");
        assert_eq!(store.query_next(1, hit.context), Err(StatusCode::NotFound));

        // Even an exact-name query cannot see a hidden variable.
        let q = QueryDescriptor {
            predicates: query::MATCH,
            match_text: "secret.temp".into(),
            ..QueryDescriptor::default()
        };
        assert_eq!(store.query_first(1, &q), Err(StatusCode::NotFound));
    }

    #[test]
    fn cursor_lifecycle() {
        let mut store = store();
        for i in 0..3 {
            store
                .add(&descriptor(&format!("var{i}"), 0, VarValue::Int32(i)))
                .unwrap();
        }
        let q = QueryDescriptor {
            predicates: query::MATCH,
            match_text: "var".into(),
            ..QueryDescriptor::default()
        };
        let first = store.query_first(7, &q).unwrap();
        assert_eq!(first.handle, 1);
        let second = store.query_next(7, first.context).unwrap();
        assert_eq!(second.handle, 2);
        let third = store.query_next(7, first.context).unwrap();
        assert_eq!(third.handle, 3);
        // Exhaustion destroys the context...
        assert_eq!(store.query_next(7, first.context), Err(StatusCode::NotFound));
        // ...and a further advance on the dead context is unsupported.
        assert_eq!(
            store.query_next(7, first.context),
            Err(StatusCode::NotSupported)
        );
    }

    #[test]
    fn query_predicates_are_conjunctive() {
        let mut store = store();
        let mut desc = descriptor("net.rx", 4, VarValue::Int32(0));
        desc.flags = VarFlags::VOLATILE.bits();
        desc.tags = vec!["net".into()];
        store.add(&desc).unwrap();
        store.add(&descriptor("net.tx", 5, VarValue::Int32(0))).unwrap();

        let q = QueryDescriptor {
            predicates: query::MATCH | query::INSTANCE | query::FLAGS | query::TAGS,
            match_text: "NET".into(),
            instance: 4,
            flags: VarFlags::VOLATILE.bits(),
            tags: vec!["net".into()],
        };
        let hit = store.query_first(1, &q).unwrap();
        assert_eq!(hit.name, "net.rx");
        assert_eq!(hit.instance, 4);

        // A filter naming an unknown tag can never match.
        let q = QueryDescriptor {
            predicates: query::TAGS,
            tags: vec!["nosuch".into()],
            ..QueryDescriptor::default()
        };
        assert_eq!(store.query_first(1, &q), Err(StatusCode::NotFound));
    }

    #[test]
    fn disconnect_drops_owned_contexts() {
        let mut store = store();
        store.add(&descriptor("a", 0, VarValue::Int32(0))).unwrap();
        store.add(&descriptor("ab", 0, VarValue::Int32(0))).unwrap();
        let q = QueryDescriptor {
            predicates: query::MATCH,
            match_text: "a".into(),
            ..QueryDescriptor::default()
        };
        let hit = store.query_first(42, &q).unwrap();
        assert_eq!(store.context_count(), 1);
        store.drop_contexts_for(42);
        assert_eq!(store.context_count(), 0);
        assert_eq!(store.query_next(42, hit.context), Err(StatusCode::NotSupported));
    }
}
