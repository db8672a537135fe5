//! Message codec and envelope definitions
//!
//! JSON-based envelopes. The dispatch tag lives at a configurable path
//! (`TagField`) so applications define their own schema; everything else
//! about an envelope is validated here, at the decode boundary, and never
//! trusted implicitly downstream.
//!
//! Two shapes are recognised:
//! - addressed envelopes carry `recipient` and `data` and can be relayed
//!   to other users; `data` is kept as raw JSON so it is delivered
//!   byte-for-byte
//! - opaque envelopes are any other tagged object

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

use crate::error::{ConfigError, DecodeError};
use crate::types::{Tag, UserId};

/// Default tag key: a single character keeps frames small
pub const DEFAULT_TAG_FIELD: &str = "t";

/// Location of the type tag inside an envelope
///
/// A dotted path: `"t"` reads the top-level `t` key, `"data.type"` reads
/// `type` inside the `data` object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagField {
    path: Vec<String>,
}

impl TagField {
    pub fn parse(path: &str) -> Result<Self, ConfigError> {
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ConfigError::InvalidValue {
                key: "TYPE_KEY",
                value: path.to_string(),
            });
        }
        Ok(Self { path: segments })
    }

    fn lookup<'a>(&self, map: &'a Map<String, Value>) -> Option<&'a Value> {
        let (first, rest) = self.path.split_first()?;
        rest.iter()
            .try_fold(map.get(first)?, |value, key| value.as_object()?.get(key))
    }

    /// Object holding only `tag` at this location
    fn wrap(&self, tag: Value) -> Value {
        self.path.iter().rev().fold(tag, |inner, key| {
            let mut map = Map::new();
            map.insert(key.clone(), inner);
            Value::Object(map)
        })
    }
}

impl Default for TagField {
    fn default() -> Self {
        Self {
            path: vec![DEFAULT_TAG_FIELD.to_string()],
        }
    }
}

impl std::fmt::Display for TagField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.join("."))
    }
}

/// Who a relayed message is for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipient {
    One(UserId),
    Many(Vec<UserId>),
}

impl Recipient {
    /// Recipients in delivery order
    pub fn ids(&self) -> &[UserId] {
        match self {
            Recipient::One(id) => std::slice::from_ref(id),
            Recipient::Many(ids) => ids,
        }
    }
}

impl From<UserId> for Recipient {
    fn from(id: UserId) -> Self {
        Recipient::One(id)
    }
}

impl From<Vec<UserId>> for Recipient {
    fn from(ids: Vec<UserId>) -> Self {
        Recipient::Many(ids)
    }
}

/// Cross-process delivery unit
///
/// Published once per origin event; every subscribed process decides
/// independently whether it holds the recipient(s).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub recipient: Recipient,
    pub data: Box<RawValue>,
}

impl RelayEnvelope {
    pub fn new(recipient: impl Into<Recipient>, data: Box<RawValue>) -> Self {
        Self {
            recipient: recipient.into(),
            data,
        }
    }

    /// Build an envelope around any serializable payload
    pub fn from_value<T: Serialize>(
        recipient: impl Into<Recipient>,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(recipient, serde_json::value::to_raw_value(data)?))
    }

    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The payload exactly as it will be written to recipients
    pub fn data(&self) -> &str {
        self.data.get()
    }
}

/// Decoded envelope
#[derive(Debug, Clone)]
pub enum Envelope {
    /// Carries a recipient and a payload to deliver to them
    Addressed {
        tag: Tag,
        relay: RelayEnvelope,
        /// All other top-level fields
        extra: Map<String, Value>,
    },
    /// Any other tagged object
    Opaque { tag: Tag, body: Map<String, Value> },
}

impl Envelope {
    pub fn tag(&self) -> &Tag {
        match self {
            Envelope::Addressed { tag, .. } | Envelope::Opaque { tag, .. } => tag,
        }
    }

    pub fn relay(&self) -> Option<&RelayEnvelope> {
        match self {
            Envelope::Addressed { relay, .. } => Some(relay),
            Envelope::Opaque { .. } => None,
        }
    }

    pub fn into_relay(self) -> Option<RelayEnvelope> {
        match self {
            Envelope::Addressed { relay, .. } => Some(relay),
            Envelope::Opaque { .. } => None,
        }
    }

    /// Top-level field other than `recipient`/`data`
    pub fn field(&self, key: &str) -> Option<&Value> {
        match self {
            Envelope::Addressed { extra, .. } => extra.get(key),
            Envelope::Opaque { body, .. } => body.get(key),
        }
    }
}

#[derive(Serialize)]
struct AddressedWire<'a> {
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
    recipient: &'a Recipient,
    data: &'a RawValue,
}

/// Envelope codec bound to one tag location
#[derive(Debug, Clone, Default)]
pub struct Codec {
    tag_field: TagField,
}

impl Codec {
    pub fn new(tag_field: TagField) -> Self {
        Self { tag_field }
    }

    pub fn tag_field(&self) -> &TagField {
        &self.tag_field
    }

    pub fn decode(&self, text: &str) -> Result<Envelope, DecodeError> {
        let Value::Object(mut map) = serde_json::from_str::<Value>(text)? else {
            return Err(DecodeError::NotAnObject);
        };

        let tag_value = self
            .tag_field
            .lookup(&map)
            .ok_or_else(|| DecodeError::MissingTag(self.tag_field.to_string()))?;
        let tag = Tag::from_json(tag_value)
            .ok_or_else(|| DecodeError::InvalidTag(self.tag_field.to_string()))?;

        if map.contains_key("recipient") && map.contains_key("data") {
            // Second pass keeps `data` as the original bytes
            let relay = RelayEnvelope::decode(text)?;
            map.remove("recipient");
            map.remove("data");
            return Ok(Envelope::Addressed {
                tag,
                relay,
                extra: map,
            });
        }

        Ok(Envelope::Opaque { tag, body: map })
    }

    /// Bare frame of type `tag`, e.g. `{"t":"cs"}`
    pub fn tagged(&self, tag: impl Into<Tag>) -> Value {
        let tag: Tag = tag.into();
        self.tag_field.wrap(Value::String(tag.as_str().to_string()))
    }

    /// Decode a binary frame holding UTF-8 text
    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<Envelope, DecodeError> {
        let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)?;
        self.decode(text)
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<String, serde_json::Error> {
        match envelope {
            Envelope::Addressed { relay, extra, .. } => serde_json::to_string(&AddressedWire {
                extra,
                recipient: &relay.recipient,
                data: &relay.data,
            }),
            Envelope::Opaque { body, .. } => serde_json::to_string(body),
        }
    }
}
