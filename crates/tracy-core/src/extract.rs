use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    Plain,
    Xss,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagMetadata {
    pub tag: String,
    pub kind: TagKind,
}

/// Turns a tag into the payload it embeds. `None` means the tag carries no tracer.
///
/// Owned by the proxy side; the tracer service only consumes it when
/// registering tracers that were generated outside a captured request.
pub trait PayloadExtractor: Send + Sync {
    fn extract_payload(&self, tag: &str) -> (TagMetadata, Option<Vec<u8>>);
}

pub struct TagExtractor {
    token: Regex,
}

impl TagExtractor {
    pub fn new() -> Self {
        Self {
            token: Regex::new(r"[A-Za-z0-9]{6,}").expect("valid regex"),
        }
    }
}

impl Default for TagExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadExtractor for TagExtractor {
    fn extract_payload(&self, tag: &str) -> (TagMetadata, Option<Vec<u8>>) {
        let kind = if tag.contains(['"', '\'', '<', '>']) {
            TagKind::Xss
        } else {
            TagKind::Plain
        };
        let metadata = TagMetadata {
            tag: tag.to_string(),
            kind,
        };
        let payload = self
            .token
            .find(tag)
            .map(|found| found.as_str().as_bytes().to_vec());
        (metadata, payload)
    }
}
