//! Change payloads delivered by providers to subscribed clients.

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

use crate::template::TemplateId;

/// Maximum length of a URI accepted by providers.
pub const URI_MAX_SIZE: usize = 256;

/// Maximum number of URIs in one subscribe or unsubscribe call.
pub const URI_MAX_COUNT: usize = 32;

/// Maximum size of a shared-config value, in bytes.
pub const VALUE_MAX_SIZE: usize = 4096;

/// A change to the rows selected by a query template on a table URI.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub struct RdbChangeNode {
    /// Table URI the change belongs to.
    pub uri: String,
    /// Template the rows were selected with.
    pub template_id: TemplateId,
    /// Serialized result rows.
    pub data: Vec<String>,
}

impl RdbChangeNode {
    /// Create a new rdb change.
    pub fn new(uri: impl Into<String>, template_id: TemplateId, data: Vec<String>) -> Self {
        Self {
            uri: uri.into(),
            template_id,
            data,
        }
    }
}

/// Value of a published data item.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub enum PublishedValue {
    /// Binary payload.
    Bytes(Vec<u8>),
    /// Text payload.
    Text(String),
}

impl From<String> for PublishedValue {
    fn from(value: String) -> Self {
        PublishedValue::Text(value)
    }
}

impl From<&str> for PublishedValue {
    fn from(value: &str) -> Self {
        PublishedValue::Text(value.to_string())
    }
}

impl From<Vec<u8>> for PublishedValue {
    fn from(value: Vec<u8>) -> Self {
        PublishedValue::Bytes(value)
    }
}

/// One published data item.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub struct PublishedDataItem {
    /// URI of the published item.
    pub key: String,
    /// Subscriber the item is published for.
    pub subscriber_id: i64,
    /// Published value.
    pub value: PublishedValue,
}

impl PublishedDataItem {
    /// Create a new published item.
    pub fn new(key: impl Into<String>, subscriber_id: i64, value: impl Into<PublishedValue>) -> Self {
        Self {
            key: key.into(),
            subscriber_id,
            value: value.into(),
        }
    }
}

/// A batch of published data changes from one owner.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub struct PublishedDataChangeNode {
    /// Bundle name of the publisher.
    pub owner_bundle_name: String,
    /// Changed items.
    pub datas: Vec<PublishedDataItem>,
}

impl PublishedDataChangeNode {
    /// Create a change node for an owner.
    pub fn new(owner_bundle_name: impl Into<String>, datas: Vec<PublishedDataItem>) -> Self {
        Self {
            owner_bundle_name: owner_bundle_name.into(),
            datas,
        }
    }

    /// Check if the node carries no items.
    pub fn is_empty(&self) -> bool {
        self.datas.is_empty()
    }
}

/// Kind of change reported for shared-config data.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub enum ChangeType {
    /// A value was inserted.
    Insert,
    /// A value was deleted.
    Delete,
    /// A value was updated.
    Update,
    /// Any other change.
    Other,
    /// Unset.
    #[default]
    Invalid,
}

/// Shared-config value.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub enum ProxyValue {
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Double(f64),
    /// String value.
    Text(String),
    /// Boolean value.
    Bool(bool),
}

impl ProxyValue {
    /// Approximate encoded size, used to enforce [`VALUE_MAX_SIZE`].
    pub fn size(&self) -> usize {
        match self {
            ProxyValue::Int(_) | ProxyValue::Double(_) => 8,
            ProxyValue::Text(text) => text.len(),
            ProxyValue::Bool(_) => 1,
        }
    }
}

/// A point notification for one shared-config URI.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub struct ProxyDataChangeInfo {
    /// Kind of change.
    pub change_type: ChangeType,
    /// URI that changed.
    pub uri: String,
    /// New value.
    pub value: ProxyValue,
}

impl ProxyDataChangeInfo {
    /// Create a new change notification.
    pub fn new(change_type: ChangeType, uri: impl Into<String>, value: ProxyValue) -> Self {
        Self {
            change_type,
            uri: uri.into(),
            value,
        }
    }
}
