//! Query cursors.
//!
//! A query is compiled once at `query-first` (tag names resolve to interned
//! ids; the substring lowers once) and the resulting context carries the
//! cursor, the last matched handle, across `query-next` calls. Contexts
//! die on exhaustion or with their owning client.

use std::collections::HashMap;

use varbus_core::wire::{QueryDescriptor, query};
use varbus_core::{Handle, StatusCode, VarFlags};

use super::tags::{TagId, TagRegistry};
use super::Variable;

/// Upper bound on simultaneously live cursors.
pub const MAX_CONTEXTS: usize = 256;

/// A compiled query: every predicate pre-resolved for cheap matching.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    predicates: u8,
    match_lower: String,
    instance: u32,
    flags: VarFlags,
    tags: Vec<TagId>,
}

impl CompiledQuery {
    /// Compiles a wire query against the tag registry.
    ///
    /// Returns `None` when a tag filter names an unknown tag; such a
    /// query can never match anything.
    #[must_use]
    pub fn compile(tags: &TagRegistry, desc: &QueryDescriptor) -> Option<Self> {
        let mut tag_ids = Vec::new();
        if desc.predicates & query::TAGS != 0 {
            for name in &desc.tags {
                tag_ids.push(tags.lookup(name)?);
            }
        }
        Some(Self {
            predicates: desc.predicates,
            match_lower: desc.match_text.to_ascii_lowercase(),
            instance: desc.instance,
            flags: VarFlags::from_bits_truncate(desc.flags),
            tags: tag_ids,
        })
    }

    /// Whether a variable matches every selected predicate.
    ///
    /// Hidden variables are excluded unconditionally.
    #[must_use]
    pub fn matches(&self, var: &Variable) -> bool {
        if var.flags.contains(VarFlags::HIDDEN) {
            return false;
        }
        if self.predicates & query::MATCH != 0
            && !var.name.to_ascii_lowercase().contains(&self.match_lower)
        {
            return false;
        }
        if self.predicates & query::INSTANCE != 0 && var.instance != self.instance {
            return false;
        }
        if self.predicates & query::FLAGS != 0 && !var.flags.contains(self.flags) {
            return false;
        }
        if self.predicates & query::TAGS != 0
            && !self.tags.iter().all(|tag| var.tags.contains(tag))
        {
            return false;
        }
        true
    }
}

/// One live cursor.
#[derive(Debug)]
pub struct SearchContext {
    owner_pid: u32,
    cursor: Handle,
    query: CompiledQuery,
}

impl SearchContext {
    /// The compiled query.
    #[must_use]
    pub const fn query(&self) -> &CompiledQuery {
        &self.query
    }

    /// Last matched handle.
    #[must_use]
    pub const fn cursor(&self) -> Handle {
        self.cursor
    }

    /// Moves the cursor past a newly matched handle.
    pub const fn advance(&mut self, handle: Handle) {
        self.cursor = handle;
    }
}

/// A matched variable plus the cursor that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryHit {
    /// Context id for `query-next`.
    pub context: u32,
    /// Matched handle.
    pub handle: Handle,
    /// Matched variable's name.
    pub name: String,
    /// Matched variable's instance id.
    pub instance: u32,
}

/// Table of live cursors.
#[derive(Debug, Default)]
pub struct SearchTable {
    contexts: HashMap<u32, SearchContext>,
    next_id: u32,
}

impl SearchTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context positioned on its first match.
    ///
    /// # Errors
    ///
    /// [`StatusCode::OutOfMemory`] when the table is full.
    pub fn create(
        &mut self,
        owner_pid: u32,
        query: CompiledQuery,
        first: Handle,
    ) -> Result<u32, StatusCode> {
        if self.contexts.len() >= MAX_CONTEXTS {
            return Err(StatusCode::OutOfMemory);
        }
        loop {
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.contexts.contains_key(&self.next_id) {
                break;
            }
        }
        let id = self.next_id;
        self.contexts.insert(
            id,
            SearchContext {
                owner_pid,
                cursor: first,
                query,
            },
        );
        Ok(id)
    }

    /// Borrows a context mutably, verifying ownership.
    #[must_use]
    pub fn get_mut(&mut self, id: u32, owner_pid: u32) -> Option<&mut SearchContext> {
        self.contexts
            .get_mut(&id)
            .filter(|ctx| ctx.owner_pid == owner_pid)
    }

    /// Destroys a context.
    pub fn destroy(&mut self, id: u32) {
        self.contexts.remove(&id);
    }

    /// Destroys every context owned by `pid`.
    pub fn drop_for(&mut self, pid: u32) {
        self.contexts.retain(|_, ctx| ctx.owner_pid != pid);
    }

    /// Number of live contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Returns `true` when no context is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
