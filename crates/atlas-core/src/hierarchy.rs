//! Hierarchy node references and the read-only directory seam
//!
//! The geographic hierarchy (region → sub-region → record) lives in its own
//! store outside this crate. Attach operations only need an existence check,
//! so the collaborator is a single-method trait.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Level of the geographic hierarchy a controller can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    /// Top-level region (e.g. a state)
    Region,
    /// Sub-region (e.g. a county)
    SubRegion,
    /// Leaf record (e.g. a parcel)
    Record,
}

impl ObjectType {
    /// Stable snake_case label, used for storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Region => "region",
            ObjectType::SubRegion => "sub_region",
            ObjectType::Record => "record",
        }
    }

    /// Parse a stored label back into an object type.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "region" => Some(ObjectType::Region),
            "sub_region" => Some(ObjectType::SubRegion),
            "record" => Some(ObjectType::Record),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to one hierarchy node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Hierarchy level
    pub object_type: ObjectType,
    /// Identifier within that level
    pub object_id: String,
}

impl ObjectRef {
    /// Build a reference from a type and id.
    pub fn new(object_type: ObjectType, object_id: impl Into<String>) -> Self {
        Self {
            object_type,
            object_id: object_id.into(),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.object_type, self.object_id)
    }
}

/// Read-only view of the hierarchy store, consulted before attach.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HierarchyDirectory: Send + Sync {
    /// Whether the referenced node exists.
    async fn exists(&self, object: &ObjectRef) -> Result<bool>;
}

/// In-memory directory for tests and embedders that manage their own
/// hierarchy.
#[derive(Debug, Default)]
pub struct StaticHierarchy {
    objects: HashSet<ObjectRef>,
}

impl StaticHierarchy {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory pre-populated with the given nodes.
    pub fn with_objects(objects: impl IntoIterator<Item = ObjectRef>) -> Self {
        Self {
            objects: objects.into_iter().collect(),
        }
    }

    /// Register a node.
    pub fn insert(&mut self, object: ObjectRef) {
        self.objects.insert(object);
    }
}

#[async_trait]
impl HierarchyDirectory for StaticHierarchy {
    async fn exists(&self, object: &ObjectRef) -> Result<bool> {
        Ok(self.objects.contains(object))
    }
}
