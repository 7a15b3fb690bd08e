//! Keyspace layout.
//!
//! All allocator state lives under a configurable root, in three subtrees:
//!
//! ```text
//! <root>/members/<zone>/<id>
//! <root>/items/<id>
//! <root>/assignments/<item>/<zone>/<member>/<slot>
//! ```
//!
//! Segments are non-empty and never contain `/`.

use crate::error::DecodeError;

const MEMBERS: &str = "members";
const ITEMS: &str = "items";
const ASSIGNMENTS: &str = "assignments";

/// Builds and parses keys under a root prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    root: String,
}

/// Identity extracted from a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedKey {
    Member {
        zone: String,
        id: String,
    },
    Item {
        id: String,
    },
    Assignment {
        item: String,
        zone: String,
        member: String,
        slot: u32,
    },
}

impl KeyLayout {
    /// Create a layout rooted at `root` (e.g. `/root`). Trailing slashes are
    /// ignored.
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Prefix covering the whole allocator subtree.
    pub fn prefix(&self) -> String {
        format!("{}/", self.root)
    }

    pub fn members_prefix(&self) -> String {
        format!("{}/{}/", self.root, MEMBERS)
    }

    pub fn member_key(&self, zone: &str, id: &str) -> String {
        format!("{}/{}/{}/{}", self.root, MEMBERS, zone, id)
    }

    pub fn items_prefix(&self) -> String {
        format!("{}/{}/", self.root, ITEMS)
    }

    pub fn item_key(&self, id: &str) -> String {
        format!("{}/{}/{}", self.root, ITEMS, id)
    }

    pub fn assignments_prefix(&self) -> String {
        format!("{}/{}/", self.root, ASSIGNMENTS)
    }

    /// Prefix holding every assignment of `item`.
    pub fn item_assignments_prefix(&self, item: &str) -> String {
        format!("{}/{}/{}/", self.root, ASSIGNMENTS, item)
    }

    pub fn assignment_key(&self, item: &str, zone: &str, member: &str, slot: u32) -> String {
        format!(
            "{}/{}/{}/{}/{}/{}",
            self.root, ASSIGNMENTS, item, zone, member, slot
        )
    }

    /// Split `key` into its entity identity.
    pub fn parse(&self, key: &str) -> Result<ParsedKey, DecodeError> {
        let rest = key
            .strip_prefix(self.root.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| DecodeError::invalid_key(key, "outside of keyspace root"))?;

        let segments: Vec<&str> = rest.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(DecodeError::invalid_key(key, "empty path segment"));
        }

        match segments.as_slice() {
            [MEMBERS, zone, id] => Ok(ParsedKey::Member {
                zone: zone.to_string(),
                id: id.to_string(),
            }),
            [ITEMS, id] => Ok(ParsedKey::Item { id: id.to_string() }),
            [ASSIGNMENTS, item, zone, member, slot] => {
                let slot = slot
                    .parse::<u32>()
                    .map_err(|e| DecodeError::invalid_key(key, format!("bad slot: {e}")))?;
                Ok(ParsedKey::Assignment {
                    item: item.to_string(),
                    zone: zone.to_string(),
                    member: member.to_string(),
                    slot,
                })
            }
            _ => Err(DecodeError::invalid_key(key, "unexpected key shape")),
        }
    }
}
