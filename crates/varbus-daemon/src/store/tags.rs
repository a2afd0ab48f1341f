//! Tag registry: name ↔ small-integer mapping.
//!
//! Tag names are interned once and referenced everywhere else by id,
//! compressing per-variable tag lists to a few bytes. Lookup is
//! case-insensitive; the first registration fixes the canonical spelling.

use varbus_core::StatusCode;

/// Interned tag identity. Zero is never issued.
pub type TagId = u8;

/// Maximum distinct tags a server will intern.
pub const MAX_REGISTRY_TAGS: usize = 64;

/// Fixed-capacity tag interner.
#[derive(Debug, Default)]
pub struct TagRegistry {
    names: Vec<String>,
}

impl TagRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a tag id by name, case-insensitively.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<TagId> {
        self.names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(name))
            .map(|idx| (idx + 1) as TagId)
    }

    /// Interns a tag, returning the existing id when the name is already
    /// registered.
    ///
    /// # Errors
    ///
    /// [`StatusCode::InvalidArgument`] for an empty name,
    /// [`StatusCode::OutOfMemory`] when the registry is full.
    pub fn register(&mut self, name: &str) -> Result<TagId, StatusCode> {
        if name.is_empty() {
            return Err(StatusCode::InvalidArgument);
        }
        if let Some(id) = self.lookup(name) {
            return Ok(id);
        }
        if self.names.len() >= MAX_REGISTRY_TAGS {
            return Err(StatusCode::OutOfMemory);
        }
        self.names.push(name.to_string());
        Ok(self.names.len() as TagId)
    }

    /// Canonical spelling of a tag.
    #[must_use]
    pub fn name(&self, id: TagId) -> Option<&str> {
        self.names.get(usize::from(id.checked_sub(1)?)).map(String::as_str)
    }

    /// Number of interned tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns `true` if no tag is interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_case_insensitive() {
        let mut tags = TagRegistry::new();
        let a = tags.register("HVAC").unwrap();
        let b = tags.register("hvac").unwrap();
        assert_eq!(a, b);
        assert_eq!(tags.name(a), Some("HVAC"));
        assert_eq!(tags.lookup("Hvac"), Some(a));
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn ids_are_dense_from_one() {
        let mut tags = TagRegistry::new();
        assert_eq!(tags.register("a").unwrap(), 1);
        assert_eq!(tags.register("b").unwrap(), 2);
        assert_eq!(tags.name(0), None);
        assert_eq!(tags.name(3), None);
    }

    #[test]
    fn capacity_and_empty_name() {
        let mut tags = TagRegistry::new();
        assert_eq!(tags.register(""), Err(StatusCode::InvalidArgument));
        for i in 0..MAX_REGISTRY_TAGS {
            tags.register(&format!("t{i}")).unwrap();
        }
        assert_eq!(tags.register("overflow"), Err(StatusCode::OutOfMemory));
        // Existing names still resolve at capacity.
        assert!(tags.register("t0").is_ok());
    }
}
