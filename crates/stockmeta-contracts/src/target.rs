use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_START_PATTERN: &str = r"^https?://([^/]+\.)?dreamstime\.com/upload";
pub const DEFAULT_NEXT_PATTERN: &str = r"^https?://([^/]+\.)?dreamstime\.com/upload/edit[0-9]+";

/// Identifier of the page/tab being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub u64);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Navigable location of a target, e.g. its URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(pub String);

impl Locator {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub location: Locator,
}

/// Opaque locator of the image to describe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetReference(pub String);

impl AssetReference {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// URL patterns that delimit the workflow: where a run may start and which
/// post-submit locations count as the next item.
#[derive(Debug, Clone)]
pub struct WorkflowPatterns {
    start: Regex,
    next: Regex,
}

impl WorkflowPatterns {
    pub fn new(start: &str, next: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            start: Regex::new(start)?,
            next: Regex::new(next)?,
        })
    }

    pub fn is_start(&self, location: &Locator) -> bool {
        self.start.is_match(location.as_str())
    }

    pub fn is_next(&self, location: &Locator) -> bool {
        self.next.is_match(location.as_str())
    }
}

impl Default for WorkflowPatterns {
    fn default() -> Self {
        Self::new(DEFAULT_START_PATTERN, DEFAULT_NEXT_PATTERN)
            .expect("default workflow patterns compile")
    }
}

#[cfg(test)]
mod tests {
    use super::{Locator, WorkflowPatterns};

    #[test]
    fn default_patterns_separate_upload_area_from_edit_pages() {
        let patterns = WorkflowPatterns::default();
        let upload = Locator::new("https://www.dreamstime.com/upload");
        let edit = Locator::new("https://www.dreamstime.com/upload/edit12345");
        let elsewhere = Locator::new("https://www.dreamstime.com/account");

        assert!(patterns.is_start(&upload));
        assert!(patterns.is_start(&edit));
        assert!(!patterns.is_start(&elsewhere));

        assert!(patterns.is_next(&edit));
        assert!(!patterns.is_next(&upload));
        assert!(!patterns.is_next(&Locator::new("https://www.dreamstime.com/upload/edit")));
    }

    #[test]
    fn patterns_can_be_overridden() -> Result<(), regex::Error> {
        let patterns = WorkflowPatterns::new(r"^https://example\.test/queue", r"/item/[0-9]+$")?;
        assert!(patterns.is_start(&Locator::new("https://example.test/queue")));
        assert!(patterns.is_next(&Locator::new("https://example.test/item/7")));
        Ok(())
    }
}
