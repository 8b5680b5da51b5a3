use tessera_core::stream::{StreamId, from_legacy_dotted};

use crate::{AccountShapeError, Catalogue, SystemStream};

impl Catalogue {
    /// Look a stream up by its exact (prefixed or dotted) id.
    pub fn get(&self, id: &str) -> Option<&SystemStream> {
        self.by_id.get(id).map(|&idx| &self.nodes[idx])
    }

    /// Like [`Catalogue::get`], additionally accepting the legacy `.name`
    /// form when enabled. Read paths only.
    pub fn get_for_read(&self, id: &str) -> Option<&SystemStream> {
        if let Some(found) = self.get(id) {
            return Some(found);
        }
        if self.legacy_dotted_reads {
            if let Some(translated) = from_legacy_dotted(id) {
                return self.get(&translated);
            }
        }
        None
    }

    /// Look up an account stream by its bare (unprefixed) name.
    pub fn get_by_unprefixed(&self, name: &str) -> Option<&SystemStream> {
        self.by_unprefixed.get(name).map(|&idx| &self.nodes[idx])
    }

    pub fn is_system_stream(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Streams under the `account` or `helpers` roots (markers included).
    pub fn is_account_stream(&self, id: &str) -> bool {
        self.derived.all_account.contains_key(id)
    }

    /// The account leaves referenced by an event's stream ids, markers
    /// excluded. See [`Catalogue::classify_account_streams`] for the full
    /// shape check.
    pub fn account_leaves_in<'c>(&'c self, stream_ids: &[StreamId]) -> Vec<&'c SystemStream> {
        stream_ids
            .iter()
            .filter_map(|id| self.get(id.as_str()))
            .filter(|s| {
                self.derived.all_account.contains_key(&s.id)
                    && !s.id.starts_with('.')
                    && s.children.is_empty()
            })
            .collect()
    }

    /// Classify an event's stream list against the account model.
    ///
    /// `Ok(None)`: the event touches no account stream at all.
    /// `Ok(Some(leaf))`: the list is exactly one account leaf plus markers.
    /// Anything else — two leaves, a leaf mixed with an unrelated stream, a
    /// marker or account root/branch without a leaf — is an error.
    pub fn classify_account_streams<'c>(
        &'c self,
        stream_ids: &[StreamId],
    ) -> Result<Option<&'c SystemStream>, AccountShapeError> {
        let leaves = self.account_leaves_in(stream_ids);
        match leaves.as_slice() {
            [] => {
                for id in stream_ids {
                    if id.is_marker() || self.is_account_stream(id.as_str()) {
                        return Err(AccountShapeError::NotAnAccountLeaf {
                            id: id.to_string(),
                        });
                    }
                }
                Ok(None)
            }
            [leaf] => {
                for id in stream_ids {
                    if !id.is_marker() && id.as_str() != leaf.id {
                        return Err(AccountShapeError::MixedWithOtherStreams {
                            id: id.to_string(),
                        });
                    }
                }
                Ok(Some(*leaf))
            }
            _ => Err(AccountShapeError::MultipleAccountLeaves),
        }
    }

    pub fn parent_of(&self, id: &str) -> Option<&str> {
        self.get(id)?.parent_id.as_deref()
    }

    /// All catalogue nodes, roots first, in build order.
    pub fn all(&self) -> impl Iterator<Item = &SystemStream> {
        self.nodes.iter()
    }

    /// Streams whose events may be returned to clients.
    pub fn readable(&self) -> impl Iterator<Item = &SystemStream> {
        self.derived.readable.values().map(|&idx| &self.nodes[idx])
    }

    /// Streams whose events may be modified through the API.
    pub fn editable(&self) -> impl Iterator<Item = &SystemStream> {
        self.derived.editable.values().map(|&idx| &self.nodes[idx])
    }

    /// All account-semantics streams (account subtree plus markers).
    pub fn all_account(&self) -> impl Iterator<Item = &SystemStream> {
        self.derived
            .all_account
            .values()
            .map(|&idx| &self.nodes[idx])
    }

    /// Account leaves whose defaults/values become events at registration.
    /// The password hash never becomes an event; the account storage owns it.
    pub fn account_attribute_leaves(&self) -> impl Iterator<Item = &SystemStream> {
        self.all_account().filter(|s| {
            s.children.is_empty()
                && !s.id.starts_with('.')
                && s.unprefixed_id() != "passwordHash"
        })
    }

    /// Bare names of indexed account streams, for register payloads.
    pub fn indexed_unprefixed(&self) -> &[String] {
        &self.derived.indexed_unprefixed
    }

    /// Bare names of unique account streams.
    pub fn unique_unprefixed(&self) -> &[String] {
        &self.derived.unique_unprefixed
    }

    pub fn is_indexed(&self, unprefixed: &str) -> bool {
        self.derived
            .indexed_unprefixed
            .iter()
            .any(|n| n == unprefixed)
    }

    pub fn is_unique(&self, unprefixed: &str) -> bool {
        self.derived
            .unique_unprefixed
            .iter()
            .any(|n| n == unprefixed)
    }

    /// Prefixed ids clients may never read events from.
    pub fn forbidden_for_reading(&self) -> impl Iterator<Item = &str> {
        self.derived.forbidden_read.iter().map(String::as_str)
    }

    /// Prefixed ids clients may never modify events on.
    pub fn forbidden_for_editing(&self) -> impl Iterator<Item = &str> {
        self.derived.forbidden_edit.iter().map(String::as_str)
    }

    pub fn is_editable(&self, id: &str) -> bool {
        !self.derived.forbidden_edit.contains(id)
    }

    /// Leaf streams of every subtree.
    pub fn leaves(&self) -> impl Iterator<Item = &str> {
        self.derived.leaves.iter().map(String::as_str)
    }

    /// Root ids whose subtrees require an explicit read grant; the
    /// permission evaluator seeds `none` tombstones from these.
    pub fn account_roots_requiring_read(&self) -> &[String] {
        &self.derived.account_roots_requiring_read
    }
}
