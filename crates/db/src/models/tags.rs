use serde::{Deserialize, Serialize};

/// Ordered set of request tags, persisted in the legacy comma-separated
/// text form (`conflict-pickme,git-ok`). Mutations keep the encoding
/// normalized: sorted, deduplicated, no blanks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct Tags(String);

impl Tags {
    pub fn new(raw: impl Into<String>) -> Self {
        let mut tags = Tags(raw.into());
        tags.normalize();
        tags
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn items(&self) -> impl Iterator<Item = &str> {
        self.0.split(',').map(str::trim).filter(|t| !t.is_empty())
    }

    fn normalize(&mut self) {
        let mut items: Vec<&str> = self.items().collect();
        items.sort_unstable();
        items.dedup();
        self.0 = items.join(",");
    }

    /// Exact membership test.
    pub fn contains(&self, tag: &str) -> bool {
        self.items().any(|t| t == tag)
    }

    /// Substring test over the serialized form. Conflict classification
    /// relies on this matching `no-conflicts` as well as `conflict-*`.
    pub fn text_contains(&self, needle: &str) -> bool {
        self.0.contains(needle)
    }

    /// True when any tag in `others` is present.
    pub fn overlaps(&self, others: &[String]) -> bool {
        self.items().any(|t| others.iter().any(|o| o == t))
    }

    pub fn add(&mut self, tag: &str) {
        if !self.contains(tag) {
            if !self.0.is_empty() {
                self.0.push(',');
            }
            self.0.push_str(tag);
            self.normalize();
        }
    }

    pub fn remove(&mut self, tag: &str) {
        if self.contains(tag) {
            let items: Vec<&str> = self.items().filter(|t| *t != tag).collect();
            self.0 = items.join(",");
        }
    }
}

impl std::fmt::Display for Tags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
