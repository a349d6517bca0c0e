//! Record → destination content transform.
//!
//! The orchestrator only sees the [`Transform`] trait. A transform must be
//! pure: the same record always yields the same content and reference data.

pub mod processor;

pub use processor::{ContentProcessor, ContentStructure, ConversationType};

use crate::record::Record;

/// Formatted content plus the structured reference metadata sent with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub content: String,
    pub reference: serde_json::Value,
}

pub trait Transform: Send + Sync {
    fn transform(&self, record: &Record) -> anyhow::Result<Transformed>;
}
