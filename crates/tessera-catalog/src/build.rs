use std::collections::HashMap;

use tessera_core::Timestamp;
use tessera_core::config::StreamSeed;
use tessera_core::stream::ensure_prefixed;

use crate::{
    ACCOUNT_ROOT, CatalogError, CatalogResult, CatalogueOptions, Derived, HELPERS_ROOT,
    OTHER_ROOT, SYSTEM_AUTHOR, SystemStream,
};

/// The immutable catalogue: every system stream, wired into a tree, plus the
/// derived query sets. Shared read-only across the process after startup.
#[derive(Debug)]
pub struct Catalogue {
    pub(crate) nodes: Vec<SystemStream>,
    pub(crate) by_id: HashMap<String, usize>,
    /// Bare name → node, for register payloads and legacy dotted reads.
    pub(crate) by_unprefixed: HashMap<String, usize>,
    pub(crate) derived: Derived,
    pub(crate) legacy_dotted_reads: bool,
}

/// Semantics a node inherits from the subtree it is planted in.
#[derive(Clone, Copy, PartialEq)]
enum Placement {
    /// Under the `account` root: values become account attributes.
    Account,
    /// The marker streams.
    Helper,
    /// Under `other`: plain streams, constrained to stay plain.
    Other,
}

impl Catalogue {
    pub fn build(options: CatalogueOptions) -> CatalogResult<Catalogue> {
        let mut builder = Builder {
            nodes: Vec::new(),
            by_id: HashMap::new(),
            by_unprefixed: HashMap::new(),
            check_unprefixed_duplicates: options.backward_compatibility_prefix,
        };

        builder.insert_root(ACCOUNT_ROOT, "account")?;
        for seed in builtin_account_children() {
            builder.insert(&seed, ACCOUNT_ROOT, true, Placement::Account)?;
        }
        for seed in &options.custom.account {
            builder.insert(seed, ACCOUNT_ROOT, false, Placement::Account)?;
        }

        builder.insert_root(HELPERS_ROOT, "helpers")?;
        for seed in builtin_helpers() {
            builder.insert(&seed, HELPERS_ROOT, true, Placement::Helper)?;
        }

        builder.insert_root(OTHER_ROOT, "other")?;
        for seed in &options.custom.other {
            builder.insert(seed, OTHER_ROOT, false, Placement::Other)?;
        }

        let derived = builder.derive();
        Ok(Catalogue {
            nodes: builder.nodes,
            by_id: builder.by_id,
            by_unprefixed: builder.by_unprefixed,
            derived,
            legacy_dotted_reads: options.legacy_dotted_reads,
        })
    }
}

struct Builder {
    nodes: Vec<SystemStream>,
    by_id: HashMap<String, usize>,
    by_unprefixed: HashMap<String, usize>,
    check_unprefixed_duplicates: bool,
}

impl Builder {
    fn insert_root(&mut self, id: &str, name: &str) -> CatalogResult<()> {
        let node = SystemStream {
            id: id.to_owned(),
            name: name.to_owned(),
            event_type: "none/none".to_owned(),
            parent_id: None,
            children: Vec::new(),
            default: None,
            is_indexed: false,
            is_unique: false,
            is_shown: true,
            is_editable: false,
            is_required_in_validation: false,
            regex_validation: None,
            created: Timestamp::UNKNOWN,
            created_by: SYSTEM_AUTHOR.to_owned(),
            modified: Timestamp::UNKNOWN,
            modified_by: SYSTEM_AUTHOR.to_owned(),
        };
        self.register(node)
    }

    fn insert(
        &mut self,
        seed: &StreamSeed,
        parent_id: &str,
        reserved: bool,
        placement: Placement,
    ) -> CatalogResult<()> {
        let id = ensure_prefixed(&seed.id, reserved);
        let bare = tessera_core::stream::strip_system_prefix(&id);

        if bare.len() < 2 {
            return Err(CatalogError::IdTooShort { id });
        }
        if !is_valid_stream_type(&seed.event_type) {
            return Err(CatalogError::MalformedType {
                id,
                event_type: seed.event_type.clone(),
            });
        }

        let node = SystemStream {
            name: seed.name.clone().unwrap_or_else(|| bare.to_owned()),
            event_type: seed.event_type.clone(),
            parent_id: Some(parent_id.to_owned()),
            children: Vec::new(),
            default: seed.default.clone(),
            is_indexed: seed.is_indexed.unwrap_or(false),
            is_unique: seed.is_unique.unwrap_or(false),
            is_shown: seed.is_shown.unwrap_or(true),
            is_editable: seed.is_editable.unwrap_or(true),
            is_required_in_validation: seed.is_required_in_validation.unwrap_or(false),
            regex_validation: seed.regex_validation.clone(),
            created: Timestamp::UNKNOWN,
            created_by: SYSTEM_AUTHOR.to_owned(),
            modified: Timestamp::UNKNOWN,
            modified_by: SYSTEM_AUTHOR.to_owned(),
            id,
        };

        if node.is_unique && !node.is_indexed {
            return Err(CatalogError::UniqueNotIndexed { id: node.id });
        }
        if placement == Placement::Other {
            check_other_constraints(&node)?;
        }

        let id = node.id.clone();
        self.register(node)?;
        self.nodes[self.by_id[parent_id]].children.push(id.clone());

        for child in &seed.children {
            self.insert(child, &id, reserved, placement)?;
        }
        Ok(())
    }

    fn register(&mut self, node: SystemStream) -> CatalogResult<()> {
        let bare = node.unprefixed_id().to_owned();
        let idx = self.nodes.len();
        if self.by_id.insert(node.id.clone(), idx).is_some() {
            return Err(CatalogError::DuplicateId { id: node.id });
        }
        if self.by_unprefixed.insert(bare.clone(), idx).is_some()
            && self.check_unprefixed_duplicates
        {
            return Err(CatalogError::DuplicateId { id: bare });
        }
        self.nodes.push(node);
        Ok(())
    }

    fn derive(&self) -> Derived {
        let mut derived = Derived::default();

        let account_subtree = self.subtree_ids(ACCOUNT_ROOT);
        let helper_subtree = self.subtree_ids(HELPERS_ROOT);

        for (idx, node) in self.nodes.iter().enumerate() {
            if node.parent_id.is_none() {
                continue;
            }
            if node.is_shown {
                derived.readable.insert(node.id.clone(), idx);
            } else {
                derived.forbidden_read.insert(node.id.clone());
            }
            if node.is_editable {
                derived.editable.insert(node.id.clone(), idx);
            } else {
                derived.forbidden_edit.insert(node.id.clone());
            }
            if node.children.is_empty() {
                derived.leaves.push(node.id.clone());
            }
            if account_subtree.contains(&idx) {
                derived.all_account.insert(node.id.clone(), idx);
                if node.is_indexed {
                    derived
                        .indexed_unprefixed
                        .push(node.unprefixed_id().to_owned());
                }
                if node.is_unique {
                    derived
                        .unique_unprefixed
                        .push(node.unprefixed_id().to_owned());
                }
            }
            if helper_subtree.contains(&idx) {
                derived.all_account.insert(node.id.clone(), idx);
            }
        }

        derived.account_roots_requiring_read =
            vec![ACCOUNT_ROOT.to_owned(), HELPERS_ROOT.to_owned()];
        derived
    }

    fn subtree_ids(&self, root: &str) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![root.to_owned()];
        while let Some(id) = stack.pop() {
            let Some(&idx) = self.by_id.get(&id) else {
                continue;
            };
            if id != root {
                out.push(idx);
            }
            stack.extend(self.nodes[idx].children.iter().cloned());
        }
        out
    }
}

fn check_other_constraints(node: &SystemStream) -> CatalogResult<()> {
    let violation = if node.is_unique {
        Some("not unique")
    } else if node.is_indexed {
        Some("not indexed")
    } else if !node.is_editable {
        Some("editable")
    } else if node.is_required_in_validation {
        Some("not required at registration")
    } else if !node.is_shown {
        Some("shown")
    } else {
        None
    };
    match violation {
        Some(constraint) => Err(CatalogError::OtherStreamConstraint {
            id: node.id.clone(),
            constraint,
        }),
        None => Ok(()),
    }
}

/// Stream types use the bare `class/format` syntax (no `series:` wrapper).
fn is_valid_stream_type(event_type: &str) -> bool {
    let Some((class, format)) = event_type.split_once('/') else {
        return false;
    };
    let ok = |s: &str| {
        !s.is_empty()
            && s.bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    };
    ok(class) && ok(format)
}

fn seed(id: &str, event_type: &str) -> StreamSeed {
    StreamSeed {
        id: id.to_owned(),
        name: None,
        event_type: event_type.to_owned(),
        is_indexed: None,
        is_unique: None,
        is_shown: None,
        is_editable: None,
        is_required_in_validation: None,
        regex_validation: None,
        default: None,
        children: Vec::new(),
    }
}

/// The built-in account attributes.
///
/// `username` and `passwordHash` are special: the username is immutable
/// after registration and the password hash is stored by the account
/// storage, never as event content.
fn builtin_account_children() -> Vec<StreamSeed> {
    let mut username = seed("username", "identifier/string");
    username.is_indexed = Some(true);
    username.is_unique = Some(true);
    username.is_editable = Some(false);
    username.is_required_in_validation = Some(true);
    username.regex_validation = Some(r"^[a-z0-9][a-z0-9-]{0,21}[a-z0-9]$".to_owned());

    let mut language = seed("language", "language/iso-639-1");
    language.is_indexed = Some(true);
    language.default = Some(serde_json::json!("en"));

    let mut app_id = seed("appId", "identifier/string");
    app_id.is_indexed = Some(true);
    app_id.is_shown = Some(false);
    app_id.is_editable = Some(false);

    let mut invitation_token = seed("invitationToken", "token/string");
    invitation_token.is_indexed = Some(true);
    invitation_token.is_shown = Some(false);
    invitation_token.is_editable = Some(false);

    let mut referer = seed("referer", "identifier/string");
    referer.is_indexed = Some(true);
    referer.is_shown = Some(false);
    referer.is_editable = Some(false);

    let mut password_hash = seed("passwordHash", "password-hash/string");
    password_hash.is_shown = Some(false);
    password_hash.is_editable = Some(false);
    password_hash.is_required_in_validation = Some(true);

    let mut storage_used = seed("storageUsed", "data-quantity/b");
    storage_used.is_editable = Some(false);
    for child in ["dbDocuments", "attachedFiles"] {
        let mut c = seed(child, "data-quantity/b");
        c.is_editable = Some(false);
        c.default = Some(serde_json::json!(0));
        storage_used.children.push(c);
    }

    vec![
        username,
        language,
        app_id,
        invitation_token,
        referer,
        password_hash,
        storage_used,
    ]
}

fn builtin_helpers() -> Vec<StreamSeed> {
    let mut active = seed(".active", "identifier/string");
    active.name = Some("active".to_owned());
    active.is_editable = Some(false);
    let mut unique = seed(".unique", "identifier/string");
    unique.name = Some("unique".to_owned());
    unique.is_editable = Some(false);
    vec![active, unique]
}
