//! Explicit changed-field sets for update planning.

use std::collections::BTreeSet;

use crate::resource::ResourceRecord;

/// Names of the fields that differ between two versions of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedFields(BTreeSet<&'static str>);

impl ChangedFields {
    /// Diff the shared and kind-specific fields of `before` and `after`.
    pub fn between(before: &ResourceRecord, after: &ResourceRecord) -> Self {
        let mut fields = BTreeSet::new();
        if before.name != after.name {
            fields.insert("name");
        }
        if before.description != after.description {
            fields.insert("description");
        }
        fields.extend(before.spec.diff(&after.spec));
        Self(fields)
    }

    pub fn from_fields(fields: impl IntoIterator<Item = &'static str>) -> Self {
        Self(fields.into_iter().collect())
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains(field)
    }

    pub fn intersects(&self, fields: &[&str]) -> bool {
        fields.iter().any(|f| self.0.contains(f))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.iter().copied()
    }
}
