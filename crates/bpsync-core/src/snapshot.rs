//! In-memory snapshot container.
//!
//! Holds one named collection per resource kind. The on-disk format is the
//! business of whoever loads or writes the snapshot; the engine only sees
//! this shape.

use crate::resource::{Resource, ResourceKind};
use serde::{Deserialize, Serialize};

/// Named collections for each resource kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    /// Schema definitions.
    pub blueprints: Vec<Resource>,
    /// Data records.
    pub entities: Vec<Resource>,
    /// Grouped policies.
    pub scorecards: Vec<Resource>,
    /// Actions and automations.
    pub actions: Vec<Resource>,
    /// Membership records.
    pub teams: Vec<Resource>,
    /// Identity records.
    pub users: Vec<Resource>,
    /// Documents.
    pub pages: Vec<Resource>,
    /// Linked-integration configs.
    pub integrations: Vec<Resource>,
}

impl Snapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// The collection for a kind.
    pub fn get(&self, kind: ResourceKind) -> &[Resource] {
        match kind {
            ResourceKind::Blueprint => &self.blueprints,
            ResourceKind::Entity => &self.entities,
            ResourceKind::Scorecard => &self.scorecards,
            ResourceKind::Action => &self.actions,
            ResourceKind::Team => &self.teams,
            ResourceKind::User => &self.users,
            ResourceKind::Page => &self.pages,
            ResourceKind::Integration => &self.integrations,
        }
    }

    /// Mutable access to the collection for a kind.
    pub fn get_mut(&mut self, kind: ResourceKind) -> &mut Vec<Resource> {
        match kind {
            ResourceKind::Blueprint => &mut self.blueprints,
            ResourceKind::Entity => &mut self.entities,
            ResourceKind::Scorecard => &mut self.scorecards,
            ResourceKind::Action => &mut self.actions,
            ResourceKind::Team => &mut self.teams,
            ResourceKind::User => &mut self.users,
            ResourceKind::Page => &mut self.pages,
            ResourceKind::Integration => &mut self.integrations,
        }
    }

    /// Replace the collection for a kind.
    pub fn set(&mut self, kind: ResourceKind, resources: Vec<Resource>) {
        *self.get_mut(kind) = resources;
    }

    /// Builder-style variant of [`Snapshot::set`].
    pub fn with(mut self, kind: ResourceKind, resources: Vec<Resource>) -> Self {
        self.set(kind, resources);
        self
    }

    /// Total number of resources across all kinds.
    pub fn len(&self) -> usize {
        ResourceKind::ALL.iter().map(|k| self.get(*k).len()).sum()
    }

    /// Whether every collection is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
