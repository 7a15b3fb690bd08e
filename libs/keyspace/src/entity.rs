//! Typed entities and the pluggable value decoder.
//!
//! Keys are parsed by the core ([`KeyLayout`](crate::KeyLayout)); a
//! [`Decoder`] only interprets value bytes. Decoding happens once, when a
//! key enters a snapshot.

use serde::Deserialize;

use crate::error::DecodeError;

/// Assignment value marking the holder as consistent.
pub const CONSISTENT: &[u8] = b"consistent";

/// Assignment value of a replica that has not yet reached steady state.
pub const PENDING: &[u8] = b"";

/// A worker process announcing capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub zone: String,
    pub id: String,
    /// Maximum Items this Member may hold. Zero means draining.
    pub item_limit: u32,
}

impl Member {
    pub fn is_draining(&self) -> bool {
        self.item_limit == 0
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: String,
    /// Number of distinct Members that should hold the Item.
    pub desired_replication: u32,
}

/// One replica slot of an Item bound to a Member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub item_id: String,
    pub member_zone: String,
    pub member_id: String,
    pub slot: u32,
    /// Set by the holder once it reached steady state for the Item.
    pub consistent: bool,
}

impl Assignment {
    /// Encoded value carrying this Assignment's consistency flag.
    pub fn encode_value(&self) -> Vec<u8> {
        encode_assignment_value(self.consistent)
    }
}

pub fn encode_assignment_value(consistent: bool) -> Vec<u8> {
    if consistent {
        CONSISTENT.to_vec()
    } else {
        PENDING.to_vec()
    }
}

/// A decoded key, resolved once at snapshot construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Member(Member),
    Item(Item),
    Assignment(Assignment),
}

/// Decodes stored values into entities.
///
/// Wire encodings of Member and Item payloads are policy, so callers supply
/// the decoder. The only constraint imposed by the allocator is that the
/// capacity/replication attribute decodes to a non-negative integer.
pub trait Decoder: Send + Sync {
    /// Decode a Member value. `zone` and `id` come from the key.
    fn decode_member(
        &self,
        key: &str,
        zone: &str,
        id: &str,
        value: &[u8],
    ) -> Result<Member, DecodeError>;

    /// Decode an Item value. `id` comes from the key.
    fn decode_item(&self, key: &str, id: &str, value: &[u8]) -> Result<Item, DecodeError>;

    /// Decode the consistency flag of an Assignment value.
    fn decode_assignment(&self, key: &str, value: &[u8]) -> Result<bool, DecodeError> {
        match value {
            CONSISTENT => Ok(true),
            PENDING => Ok(false),
            _ => Err(DecodeError::invalid_value(key, "unknown assignment value")),
        }
    }
}

/// Decoder for JSON values carrying an `"R"` attribute, e.g. `{"R": 3}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

#[derive(Deserialize)]
struct RValue {
    #[serde(rename = "R")]
    r: i64,
}

fn decode_r(key: &str, value: &[u8]) -> Result<u32, DecodeError> {
    let parsed: RValue = serde_json::from_slice(value)
        .map_err(|e| DecodeError::invalid_value(key, e.to_string()))?;
    if parsed.r < 0 {
        return Err(DecodeError::NegativeReplication {
            key: key.to_string(),
            value: parsed.r,
        });
    }
    u32::try_from(parsed.r).map_err(|_| DecodeError::invalid_value(key, "R out of range"))
}

impl Decoder for JsonDecoder {
    fn decode_member(
        &self,
        key: &str,
        zone: &str,
        id: &str,
        value: &[u8],
    ) -> Result<Member, DecodeError> {
        Ok(Member {
            zone: zone.to_string(),
            id: id.to_string(),
            item_limit: decode_r(key, value)?,
        })
    }

    fn decode_item(&self, key: &str, id: &str, value: &[u8]) -> Result<Item, DecodeError> {
        Ok(Item {
            id: id.to_string(),
            desired_replication: decode_r(key, value)?,
        })
    }
}
