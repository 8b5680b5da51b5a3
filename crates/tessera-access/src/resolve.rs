//! Stream and tag level resolution.

use tessera_core::access::PermissionLevel;
use tessera_core::stream::StreamId;

use crate::AccessLogic;

impl AccessLogic {
    /// Effective level for a stream:
    ///
    /// 1. exact grant;
    /// 2. first explicit grant on the ancestry walk;
    /// 3. account streams never fall back further — explicit grants only;
    /// 4. the store's `*` level, if any.
    ///
    /// Results are cached per instance. Personal accesses bypass this.
    pub fn level_for(&self, stream_id: &StreamId) -> Option<PermissionLevel> {
        if let Some(cached) = self
            .resolution_cache
            .read()
            .expect("Locking failed")
            .get(stream_id.as_str())
        {
            return *cached;
        }

        let resolved = self.resolve_uncached(stream_id);
        self.resolution_cache
            .write()
            .expect("Locking failed")
            .insert(stream_id.as_str().to_owned(), resolved);
        resolved
    }

    fn lookup_exact(&self, stream_id: &str) -> Option<PermissionLevel> {
        let id = StreamId::new(stream_id);
        let (store, local) = id.split_store();
        self.stream_perms.get(store)?.get(local).copied()
    }

    fn resolve_uncached(&self, stream_id: &StreamId) -> Option<PermissionLevel> {
        if let Some(level) = self.lookup_exact(stream_id.as_str()) {
            return Some(level);
        }

        let mut cursor = stream_id.as_str().to_owned();
        while let Some(parent) = self.tree.parent_of(&cursor) {
            if let Some(level) = self.lookup_exact(&parent) {
                return Some(level);
            }
            cursor = parent;
        }

        // account data requires explicit grants, never the wildcard
        if self.catalog.is_account_stream(stream_id.as_str()) {
            return None;
        }

        let (store, _) = stream_id.split_store();
        self.star_levels.get(store).copied()
    }

    fn level_at_least(&self, stream_id: &StreamId, level: PermissionLevel) -> bool {
        self.level_for(stream_id)
            .is_some_and(|held| held.at_least(level))
    }

    fn is_create_only(&self, stream_id: &StreamId) -> bool {
        self.level_for(stream_id) == Some(PermissionLevel::CreateOnly)
    }

    // --- stream predicates ------------------------------------------------

    pub fn can_list_stream(&self, stream_id: &StreamId) -> bool {
        self.is_personal() || self.level_at_least(stream_id, PermissionLevel::Read)
    }

    pub fn can_get_events_on_stream(&self, stream_id: &StreamId) -> bool {
        self.is_personal()
            || (self.level_at_least(stream_id, PermissionLevel::Read)
                && !self.is_create_only(stream_id))
    }

    pub fn can_create_events_on_stream(&self, stream_id: &StreamId) -> bool {
        self.is_personal() || self.level_at_least(stream_id, PermissionLevel::Contribute)
    }

    pub fn can_update_events_on_stream(&self, stream_id: &StreamId) -> bool {
        self.is_personal()
            || (self.can_create_events_on_stream(stream_id) && !self.is_create_only(stream_id))
    }

    pub fn can_delete_events_on_stream(&self, stream_id: &StreamId) -> bool {
        self.can_update_events_on_stream(stream_id)
    }

    pub fn can_create_child_on_stream(&self, stream_id: &StreamId) -> bool {
        self.is_personal()
            || (self.level_at_least(stream_id, PermissionLevel::Manage)
                && !self.is_create_only(stream_id))
    }

    pub fn can_update_stream(&self, stream_id: &StreamId) -> bool {
        self.can_create_child_on_stream(stream_id)
    }

    pub fn can_delete_stream(&self, stream_id: &StreamId) -> bool {
        self.can_create_child_on_stream(stream_id)
    }

    // --- tag predicates ---------------------------------------------------

    fn tag_level(&self, tag: &str) -> Option<PermissionLevel> {
        let exact = self.tag_perms.get(tag).copied();
        let star = self.tag_perms.get("*").copied();
        match (exact, star) {
            (Some(a), Some(b)) => Some(if a.rank() < b.rank() { b } else { a }),
            (a, b) => a.or(b),
        }
    }

    pub fn can_get_events_with_any_tag(&self) -> bool {
        self.is_personal()
            || self
                .tag_perms
                .get("*")
                .is_some_and(|level| level.at_least(PermissionLevel::Read))
    }

    pub fn can_get_events_with_tag(&self, tag: &str) -> bool {
        self.is_personal()
            || self
                .tag_level(tag)
                .is_some_and(|level| level.at_least(PermissionLevel::Read))
    }

    pub fn can_create_events_with_tag(&self, tag: &str) -> bool {
        self.is_personal()
            || self
                .tag_level(tag)
                .is_some_and(|level| level.at_least(PermissionLevel::Contribute))
    }

    /// Stream and tag conditions compose: the stream must be readable, and
    /// either tags are universally readable or one of the given tags is.
    pub fn can_get_events_on_stream_and_with_tags(
        &self,
        stream_id: &StreamId,
        tags: &[String],
    ) -> bool {
        if !self.can_get_events_on_stream(stream_id) {
            return false;
        }
        self.can_get_events_with_any_tag()
            || tags.iter().any(|tag| self.can_get_events_with_tag(tag))
    }
}
