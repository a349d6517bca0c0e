//! Source lifelog records.
//!
//! Defines [`Record`] (one lifelog entry as returned by the source API) and
//! [`ContentNode`] (the recursive content tree inside it).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A lifelog entry from the source API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Immutable source identifier.
    pub id: String,
    pub title: String,
    /// Raw markdown body, when the source includes it.
    #[serde(default)]
    pub markdown: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_to_default")]
    pub is_starred: bool,
    /// Revision marker; the watermark advances along this field.
    pub updated_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_to_default")]
    pub contents: Vec<ContentNode>,
}

impl Record {
    /// Parse a record from a raw JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Whole minutes between start and end.
    pub fn duration_minutes(&self) -> i64 {
        (self.end_time - self.start_time).num_minutes()
    }

    /// Depth-first iterator over every content node in the tree.
    pub fn nodes(&self) -> NodeIter<'_> {
        NodeIter {
            stack: self.contents.iter().rev().collect(),
        }
    }
}

/// One node in the content tree (heading, blockquote, paragraph, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentNode {
    #[serde(rename = "type", default, deserialize_with = "null_to_default")]
    pub node_type: String,
    #[serde(default, deserialize_with = "null_to_default")]
    pub content: String,
    #[serde(default, deserialize_with = "lenient_time", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_time", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_offset_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_offset_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_name: Option<String>,
    /// `"user"` when the speaker is the device owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_identifier: Option<String>,
    #[serde(default, deserialize_with = "null_to_default")]
    pub children: Vec<ContentNode>,
}

impl ContentNode {
    pub fn is_user(&self) -> bool {
        self.speaker_identifier.as_deref() == Some("user")
    }
}

/// Pre-order traversal of a content tree.
pub struct NodeIter<'a> {
    stack: Vec<&'a ContentNode>,
}

impl<'a> Iterator for NodeIter<'a> {
    type Item = &'a ContentNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

fn null_to_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// Node timestamps are informational; a bad one drops the field, not the record.
fn lenient_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc)))
}
