use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tessera_catalog::Catalogue;
use tessera_core::access::{Access, FeatureKind, FeatureSetting, Permission, PermissionLevel};
use tessera_core::stream::{LOCAL_STORE, StreamId};
use tracing::trace;

use crate::{AccessLogic, CatalogueTree, LOG_TARGET, StoreRegistry, StreamTree};

pub struct AccessLogicBuilder {
    catalog: Arc<Catalogue>,
    tree: Arc<dyn StreamTree>,
    stores: StoreRegistry,
    self_audit_enabled: bool,
}

impl AccessLogicBuilder {
    pub fn new(catalog: Arc<Catalogue>) -> Self {
        let tree = Arc::new(CatalogueTree(catalog.clone()));
        Self {
            catalog,
            tree,
            stores: StoreRegistry::default(),
            self_audit_enabled: true,
        }
    }

    pub fn with_tree(mut self, tree: Arc<dyn StreamTree>) -> Self {
        self.tree = tree;
        self
    }

    pub fn with_stores(mut self, stores: StoreRegistry) -> Self {
        self.stores = stores;
        self
    }

    pub fn with_self_audit(mut self, enabled: bool) -> Self {
        self.self_audit_enabled = enabled;
        self
    }

    /// Build the policy object for one loaded access.
    pub fn build(&self, access: Access) -> AccessLogic {
        let mut logic = AccessLogic {
            access,
            stream_perms: HashMap::new(),
            star_levels: HashMap::new(),
            tag_perms: HashMap::new(),
            self_revoke: None,
            forced_streams: Vec::new(),
            forced_by_store: HashMap::new(),
            catalog: self.catalog.clone(),
            tree: self.tree.clone(),
            resolution_cache: RwLock::new(HashMap::new()),
        };

        if logic.is_personal() {
            // personal tokens never consult a permission list
            return logic;
        }

        // account data is forbidden unless an explicit higher grant overrides
        for root in self.catalog.account_roots_requiring_read() {
            grant_stream(&mut logic, &StreamId::new(root.clone()), PermissionLevel::None);
        }

        let mut self_audit = None;
        let mut has_explicit_stream_perms = false;
        let permissions = logic.access.permissions.clone();
        for permission in &permissions {
            match permission {
                Permission::Stream { stream_id, level } => {
                    if stream_id.as_str() == "*" {
                        grant_star(&mut logic, LOCAL_STORE, *level);
                        for store in self.stores.star_included() {
                            grant_star(&mut logic, store, *level);
                        }
                    } else {
                        grant_stream(&mut logic, stream_id, *level);
                    }
                    has_explicit_stream_perms = true;
                }
                Permission::Tag { tag, level } => {
                    grant_tag(&mut logic, tag, *level);
                }
                Permission::Feature {
                    feature,
                    setting,
                    streams,
                } => match feature {
                    FeatureKind::SelfRevoke => logic.self_revoke = *setting,
                    FeatureKind::SelfAudit => self_audit = *setting,
                    FeatureKind::ForcedStreams => {
                        for id in streams.iter().flatten() {
                            let (store, local) = id.split_store();
                            logic
                                .forced_by_store
                                .entry(store.to_owned())
                                .or_default()
                                .push(local.to_owned());
                            logic.forced_streams.push(id.clone());
                        }
                    }
                },
            }
        }

        // every access may read its own audit trail unless the operator or
        // the access itself turned that off
        if self.self_audit_enabled && self_audit != Some(FeatureSetting::Forbidden) {
            let audit_stream =
                StreamId::new(format!(":_audit:access-{}", logic.access.id));
            grant_stream(&mut logic, &audit_stream, PermissionLevel::Read);
        }

        // tag-unaware events stay visible to stream-scoped accesses
        if logic.tag_perms.is_empty() && has_explicit_stream_perms {
            grant_tag(&mut logic, "*", PermissionLevel::Read);
        }

        trace!(
            target: LOG_TARGET,
            access = %logic.access.id,
            streams = logic.stream_perms.values().map(HashMap::len).sum::<usize>(),
            tags = logic.tag_perms.len(),
            "Built access policy"
        );
        logic
    }
}

/// Level-monotonic merge: a higher level always wins, equal ranks keep the
/// earlier entry (so explicit grants override the pre-seeded tombstones,
/// and `create-only` is not silently widened to `contribute`).
fn merge(slot: &mut PermissionLevel, level: PermissionLevel) {
    if slot.rank() < level.rank() {
        *slot = level;
    }
}

fn grant_stream(logic: &mut AccessLogic, stream_id: &StreamId, level: PermissionLevel) {
    let (store, local) = stream_id.split_store();
    let slot = logic
        .stream_perms
        .entry(store.to_owned())
        .or_default()
        .entry(local.to_owned());
    match slot {
        std::collections::hash_map::Entry::Occupied(mut entry) => merge(entry.get_mut(), level),
        std::collections::hash_map::Entry::Vacant(entry) => {
            entry.insert(level);
        }
    }
}

fn grant_star(logic: &mut AccessLogic, store: &str, level: PermissionLevel) {
    match logic.star_levels.entry(store.to_owned()) {
        std::collections::hash_map::Entry::Occupied(mut entry) => merge(entry.get_mut(), level),
        std::collections::hash_map::Entry::Vacant(entry) => {
            entry.insert(level);
        }
    }
}

fn grant_tag(logic: &mut AccessLogic, tag: &str, level: PermissionLevel) {
    match logic.tag_perms.entry(tag.to_owned()) {
        std::collections::hash_map::Entry::Occupied(mut entry) => merge(entry.get_mut(), level),
        std::collections::hash_map::Entry::Vacant(entry) => {
            entry.insert(level);
        }
    }
}
