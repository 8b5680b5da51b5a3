//! Permission evaluation for accesses.
//!
//! An [`AccessLogic`] is built once when an access is loaded (and cached by
//! token), then answers every `can*` question for the request lifetime.
//! Construction materializes everything implicit — account-root `none`
//! tombstones, the audit self-read grant, the catch-all tag grant — so that
//! query-time evaluation is pure lookup plus an ancestry walk.
//!
//! Personal accesses short-circuit: they hold no permission list and answer
//! yes to everything their type is allowed to do.

mod authority;
mod build;
mod methods;
mod resolve;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tessera_catalog::Catalogue;
use tessera_core::access::{Access, AccessType, FeatureSetting, PermissionLevel};
use tessera_core::stream::StreamId;

pub use self::authority::AuthorityDenial;
pub use self::build::AccessLogicBuilder;

const LOG_TARGET: &str = "tessera::access";

/// Ancestry lookup across every stream store. Ids are full (prefixed) ids;
/// the returned parent is full as well, so a walk may cross store
/// boundaries (a customer account stream's parent is the reserved account
/// root).
pub trait StreamTree: Send + Sync {
    fn parent_of(&self, stream_id: &str) -> Option<String>;
}

/// System streams are the only tree this node serves; plain local streams
/// are flat.
pub struct CatalogueTree(pub Arc<Catalogue>);

impl StreamTree for CatalogueTree {
    fn parent_of(&self, stream_id: &str) -> Option<String> {
        self.0.parent_of(stream_id).map(str::to_owned)
    }
}

/// Which stores a `local` `*` stream permission extends into.
#[derive(Debug, Clone, Default)]
pub struct StoreRegistry {
    star_included: Vec<String>,
}

impl StoreRegistry {
    pub fn with_star_included(stores: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            star_included: stores.into_iter().map(Into::into).collect(),
        }
    }

    pub fn star_included(&self) -> &[String] {
        &self.star_included
    }
}

/// The built policy for one access.
pub struct AccessLogic {
    access: Access,
    /// store → store-local stream id → level (explicit + implicit grants).
    stream_perms: HashMap<String, HashMap<String, PermissionLevel>>,
    /// `*` stream-permission level per store.
    star_levels: HashMap<String, PermissionLevel>,
    tag_perms: HashMap<String, PermissionLevel>,
    self_revoke: Option<FeatureSetting>,
    forced_streams: Vec<StreamId>,
    forced_by_store: HashMap<String, Vec<String>>,
    catalog: Arc<Catalogue>,
    tree: Arc<dyn StreamTree>,
    /// full stream id → resolved level, filled on first resolution.
    resolution_cache: RwLock<HashMap<String, Option<PermissionLevel>>>,
}

impl AccessLogic {
    pub fn access(&self) -> &Access {
        &self.access
    }

    pub fn is_personal(&self) -> bool {
        self.access.access_type == AccessType::Personal
    }

    /// Effective self-revocation setting; absent means allowed.
    pub fn self_revoke_setting(&self) -> FeatureSetting {
        self.self_revoke.unwrap_or(FeatureSetting::Allowed)
    }

    pub fn forced_streams(&self) -> &[StreamId] {
        &self.forced_streams
    }

    pub fn forced_streams_for_store(&self, store_id: &str) -> Option<&[String]> {
        self.forced_by_store.get(store_id).map(Vec::as_slice)
    }
}

impl std::fmt::Debug for AccessLogic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessLogic")
            .field("access", &self.access.id)
            .field("type", &self.access.access_type)
            .finish_non_exhaustive()
    }
}
