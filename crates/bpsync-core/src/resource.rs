//! Loosely-typed resources and the per-kind identity table.
//!
//! A [`Resource`] is an ordered string-keyed map of JSON values. Every
//! [`ResourceKind`] designates which field (or pair of fields, for kinds
//! scoped under a parent schema) identifies an instance.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from the typed field accessors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    /// The field is absent.
    #[error("field '{0}' is missing")]
    Missing(String),

    /// The field is present but holds another JSON type.
    #[error("field '{field}' is not {expected}")]
    WrongType {
        /// Name of the field.
        field: String,
        /// Expected JSON type.
        expected: &'static str,
    },

    /// An identity field is present but empty.
    #[error("field '{0}' is empty")]
    Empty(String),
}

/// Error returned when parsing an unknown resource kind name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown resource kind: {0}")]
pub struct UnknownKind(pub String);

/// Kinds of resources the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Schema definition.
    Blueprint,
    /// Data record belonging to a blueprint.
    Entity,
    /// Grouped policy scoped under a blueprint.
    Scorecard,
    /// Action or automation.
    Action,
    /// Membership record.
    Team,
    /// Identity record.
    User,
    /// Document.
    Page,
    /// Linked-integration config.
    Integration,
}

/// How a kind identifies its instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// A single top-level field.
    Single(&'static str),
    /// A parent schema field plus an identifier field.
    Scoped {
        /// Field naming the parent schema.
        parent: &'static str,
        /// Field naming the instance within the parent.
        id: &'static str,
    },
}

/// Audit metadata stripped from payloads before they are sent.
pub const AUDIT_FIELDS: &[&str] = &["createdBy", "updatedBy", "createdAt", "updatedAt", "id"];

/// Layout fields the target manages on pages.
pub const PAGE_LAYOUT_FIELDS: &[&str] = &["protected", "after", "section", "sidebar"];

impl ResourceKind {
    /// Every kind, in import order.
    pub const ALL: [ResourceKind; 8] = [
        ResourceKind::Blueprint,
        ResourceKind::Entity,
        ResourceKind::Scorecard,
        ResourceKind::Action,
        ResourceKind::Team,
        ResourceKind::User,
        ResourceKind::Page,
        ResourceKind::Integration,
    ];

    /// Singular name, used in error reports.
    pub fn name(&self) -> &'static str {
        match self {
            ResourceKind::Blueprint => "blueprint",
            ResourceKind::Entity => "entity",
            ResourceKind::Scorecard => "scorecard",
            ResourceKind::Action => "action",
            ResourceKind::Team => "team",
            ResourceKind::User => "user",
            ResourceKind::Page => "page",
            ResourceKind::Integration => "integration",
        }
    }

    /// Plural name, as used by the kind filter and snapshot files.
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Blueprint => "blueprints",
            ResourceKind::Entity => "entities",
            ResourceKind::Scorecard => "scorecards",
            ResourceKind::Action => "actions",
            ResourceKind::Team => "teams",
            ResourceKind::User => "users",
            ResourceKind::Page => "pages",
            ResourceKind::Integration => "integrations",
        }
    }

    /// The identity rule for this kind.
    pub fn identity(&self) -> Identity {
        match self {
            ResourceKind::Blueprint | ResourceKind::Action | ResourceKind::Page => {
                Identity::Single("identifier")
            }
            ResourceKind::Entity => Identity::Scoped {
                parent: "blueprint",
                id: "identifier",
            },
            ResourceKind::Scorecard => Identity::Scoped {
                parent: "blueprintIdentifier",
                id: "identifier",
            },
            ResourceKind::Team => Identity::Single("name"),
            ResourceKind::User => Identity::Single("email"),
            ResourceKind::Integration => Identity::Single("installationId"),
        }
    }

    /// Whether instances are listed per parent schema.
    pub fn is_scoped(&self) -> bool {
        matches!(self.identity(), Identity::Scoped { .. })
    }

    /// Fields removed from a payload before it is sent to the target.
    pub fn payload_excluded_fields(&self) -> Vec<&'static str> {
        match self {
            ResourceKind::Page => AUDIT_FIELDS.iter().chain(PAGE_LAYOUT_FIELDS).copied().collect(),
            ResourceKind::Action | ResourceKind::User | ResourceKind::Scorecard => {
                AUDIT_FIELDS.to_vec()
            }
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResourceKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "blueprint" | "blueprints" => ResourceKind::Blueprint,
            "entity" | "entities" => ResourceKind::Entity,
            "scorecard" | "scorecards" => ResourceKind::Scorecard,
            "action" | "actions" | "automation" | "automations" => ResourceKind::Action,
            "team" | "teams" => ResourceKind::Team,
            "user" | "users" => ResourceKind::User,
            "page" | "pages" => ResourceKind::Page,
            "integration" | "integrations" => ResourceKind::Integration,
            _ => return Err(UnknownKind(s.to_string())),
        };
        Ok(kind)
    }
}

/// Identity of a resource within its kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Parent schema identifier, for scoped kinds.
    pub parent: Option<String>,
    /// Identifier within the kind (or within the parent).
    pub id: String,
}

impl ResourceKey {
    /// Key for an unscoped resource.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            parent: None,
            id: id.into(),
        }
    }

    /// Key for a resource scoped under a parent schema.
    pub fn scoped(parent: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            parent: Some(parent.into()),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{}:{}", parent, self.id),
            None => f.write_str(&self.id),
        }
    }
}

/// A loosely-typed record: an ordered map from field name to JSON value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(Map<String, Value>);

impl Resource {
    /// Create an empty resource.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a resource from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, FieldError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(FieldError::WrongType {
                field: "<root>".to_string(),
                expected: "an object",
            }),
        }
    }

    /// Raw access to a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Whether the field is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Read a string field.
    pub fn get_str(&self, key: &str) -> Result<&str, FieldError> {
        match self.0.get(key) {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(FieldError::WrongType {
                field: key.to_string(),
                expected: "a string",
            }),
            None => Err(FieldError::Missing(key.to_string())),
        }
    }

    /// Read an object field.
    pub fn get_map(&self, key: &str) -> Result<&Map<String, Value>, FieldError> {
        match self.0.get(key) {
            Some(Value::Object(map)) => Ok(map),
            Some(_) => Err(FieldError::WrongType {
                field: key.to_string(),
                expected: "an object",
            }),
            None => Err(FieldError::Missing(key.to_string())),
        }
    }

    /// Read a boolean field.
    pub fn get_bool(&self, key: &str) -> Result<bool, FieldError> {
        match self.0.get(key) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(FieldError::WrongType {
                field: key.to_string(),
                expected: "a boolean",
            }),
            None => Err(FieldError::Missing(key.to_string())),
        }
    }

    /// Set a field, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Remove a field, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// A copy of this resource without the given fields.
    pub fn without(&self, fields: &[&str]) -> Resource {
        Resource(
            self.0
                .iter()
                .filter(|(k, _)| !fields.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consume into the underlying map.
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the resource has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Extract the identity key of this resource under `kind`'s rule.
    pub fn key(&self, kind: ResourceKind) -> Result<ResourceKey, FieldError> {
        match kind.identity() {
            Identity::Single(field) => Ok(ResourceKey::new(self.identity_str(field)?)),
            Identity::Scoped { parent, id } => Ok(ResourceKey::scoped(
                self.identity_str(parent)?,
                self.identity_str(id)?,
            )),
        }
    }

    /// The `identifier` field of a schema definition.
    pub fn identifier(&self) -> Result<&str, FieldError> {
        self.identity_str("identifier")
    }

    fn identity_str(&self, field: &str) -> Result<&str, FieldError> {
        let value = self.get_str(field)?;
        if value.is_empty() {
            return Err(FieldError::Empty(field.to_string()));
        }
        Ok(value)
    }
}

impl From<Map<String, Value>> for Resource {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Resource> for Value {
    fn from(resource: Resource) -> Self {
        Value::Object(resource.0)
    }
}

impl TryFrom<Value> for Resource {
    type Error = FieldError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Resource::from_value(value)
    }
}
