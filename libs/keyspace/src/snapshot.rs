//! Immutable, revision-stamped views of the mirrored keyspace.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::entity::{Assignment, Decoder, Entity, Item, Member};
use crate::error::{DecodeError, KeySpaceError};
use crate::keys::{KeyLayout, ParsedKey};
use crate::store::{Event, KeyValue, WatchResponse};

/// A decoded key with its store revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub entity: Entity,
    pub create_revision: i64,
    pub mod_revision: i64,
}

/// Point-in-time view of the keyspace.
///
/// Entries are ordered by key, so every Member, Item, and the Assignments
/// of one Item are contiguous ranges. A snapshot is never mutated once
/// published; the mirror builds a successor instead.
#[derive(Debug, Clone)]
pub struct Snapshot {
    revision: i64,
    layout: KeyLayout,
    entries: BTreeMap<String, Arc<Entry>>,
}

fn decode_entry(
    layout: &KeyLayout,
    decoder: &dyn Decoder,
    kv: &KeyValue,
) -> Result<Entry, DecodeError> {
    let entity = match layout.parse(&kv.key)? {
        ParsedKey::Member { zone, id } => {
            Entity::Member(decoder.decode_member(&kv.key, &zone, &id, &kv.value)?)
        }
        ParsedKey::Item { id } => Entity::Item(decoder.decode_item(&kv.key, &id, &kv.value)?),
        ParsedKey::Assignment {
            item,
            zone,
            member,
            slot,
        } => Entity::Assignment(Assignment {
            consistent: decoder.decode_assignment(&kv.key, &kv.value)?,
            item_id: item,
            member_zone: zone,
            member_id: member,
            slot,
        }),
    };
    Ok(Entry {
        key: kv.key.clone(),
        entity,
        create_revision: kv.create_revision,
        mod_revision: kv.mod_revision,
    })
}

impl Snapshot {
    /// An empty snapshot at revision 0.
    pub fn empty(layout: KeyLayout) -> Self {
        Self {
            revision: 0,
            layout,
            entries: BTreeMap::new(),
        }
    }

    /// Decode a full ranged read. Any undecodable value fails the whole
    /// snapshot.
    pub fn from_kvs(
        layout: KeyLayout,
        revision: i64,
        kvs: &[KeyValue],
        decoder: &dyn Decoder,
    ) -> Result<Self, DecodeError> {
        let mut entries = BTreeMap::new();
        for kv in kvs {
            let entry = decode_entry(&layout, decoder, kv)?;
            entries.insert(kv.key.clone(), Arc::new(entry));
        }
        Ok(Self {
            revision,
            layout,
            entries,
        })
    }

    /// Apply one revision of watch events in place.
    ///
    /// Revisions must strictly increase, and every event must belong to the
    /// response's revision.
    pub(crate) fn apply(
        &mut self,
        response: &WatchResponse,
        decoder: &dyn Decoder,
    ) -> Result<(), KeySpaceError> {
        if response.revision <= self.revision {
            return Err(KeySpaceError::WatchGap {
                mirror: self.revision,
                received: response.revision,
            });
        }
        for event in &response.events {
            if event.mod_revision() != response.revision {
                return Err(KeySpaceError::WatchGap {
                    mirror: self.revision,
                    received: event.mod_revision(),
                });
            }
            match event {
                Event::Put(kv) => {
                    let entry = decode_entry(&self.layout, decoder, kv)?;
                    self.entries.insert(kv.key.clone(), Arc::new(entry));
                }
                Event::Delete { key, .. } => {
                    self.entries.remove(key);
                }
            }
        }
        self.revision = response.revision;
        Ok(())
    }

    pub fn revision(&self) -> i64 {
        self.revision
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key).map(Arc::as_ref)
    }

    /// All entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values().map(Arc::as_ref)
    }

    fn range(&self, prefix: String) -> impl Iterator<Item = &Entry> {
        self.entries
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .map(|(_, e)| e.as_ref())
    }

    pub fn members(&self) -> impl Iterator<Item = (&Entry, &Member)> {
        self.range(self.layout.members_prefix())
            .filter_map(|e| match &e.entity {
                Entity::Member(m) => Some((e, m)),
                _ => None,
            })
    }

    pub fn items(&self) -> impl Iterator<Item = (&Entry, &Item)> {
        self.range(self.layout.items_prefix())
            .filter_map(|e| match &e.entity {
                Entity::Item(i) => Some((e, i)),
                _ => None,
            })
    }

    pub fn assignments(&self) -> impl Iterator<Item = (&Entry, &Assignment)> {
        self.range(self.layout.assignments_prefix())
            .filter_map(as_assignment)
    }

    /// Assignments of a single Item, in key order (not Slot order).
    pub fn item_assignments(&self, item_id: &str) -> impl Iterator<Item = (&Entry, &Assignment)> {
        self.range(self.layout.item_assignments_prefix(item_id))
            .filter_map(as_assignment)
    }

    pub fn member(&self, zone: &str, id: &str) -> Option<(&Entry, &Member)> {
        let entry = self.get(&self.layout.member_key(zone, id))?;
        match &entry.entity {
            Entity::Member(m) => Some((entry, m)),
            _ => None,
        }
    }

    pub fn item(&self, id: &str) -> Option<(&Entry, &Item)> {
        let entry = self.get(&self.layout.item_key(id))?;
        match &entry.entity {
            Entity::Item(i) => Some((entry, i)),
            _ => None,
        }
    }
}

fn as_assignment(entry: &Entry) -> Option<(&Entry, &Assignment)> {
    match &entry.entity {
        Entity::Assignment(a) => Some((entry, a)),
        _ => None,
    }
}
