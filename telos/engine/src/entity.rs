//! Identity primitives shared by every domain object.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a registered entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses the hex or hyphenated form.
    pub fn parse(raw: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(raw).map(Self)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Identifier of one per-cycle scheduling instance of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloneId(pub Uuid);

impl CloneId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CloneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Concrete kind of a registered entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// Resolvable belief, environment or channel path.
    Attribute,
    /// Belief revision rule.
    BeliefReviewFunction,
    /// Staged promotion rule of a goal.
    GoalPromotion,
    /// Ordered action sequence with a priority threshold.
    Plan,
    /// Side-effecting routine.
    Action,
    /// Goal template.
    Goal,
    /// Set of mutually exclusive goals.
    Conflict,
    /// Owner of beliefs, rules and goals.
    Agent,
}

impl EntityKind {
    /// Label used in rendered descriptions.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Attribute => "Attribute",
            Self::BeliefReviewFunction => "BeliefReviewFunction",
            Self::GoalPromotion => "GoalPromotion",
            Self::Plan => "Plan",
            Self::Action => "Action",
            Self::Goal => "Goal",
            Self::Conflict => "Conflict",
            Self::Agent => "Agent",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity and description common to all entities. Equality is id equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMeta {
    /// Immutable identifier.
    pub id: EntityId,
    /// Entity kind.
    pub kind: EntityKind,
    /// Optional short name (promotion stage, attribute path).
    pub name: Option<String>,
    /// Human-readable description.
    pub desc: String,
}

impl EntityMeta {
    /// Creates metadata with a fresh id.
    #[must_use]
    pub fn new(kind: EntityKind, desc: impl Into<String>) -> Self {
        Self {
            id: EntityId::generate(),
            kind,
            name: None,
            desc: desc.into(),
        }
    }

    /// Sets the short name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// `Kind: name - desc`, omitting empty parts.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = self.kind.label().to_string();
        if let Some(name) = &self.name {
            out.push_str(": ");
            out.push_str(name);
        }
        if !self.desc.is_empty() {
            out.push_str(" - ");
            out.push_str(&self.desc);
        }
        out
    }
}

impl PartialEq for EntityMeta {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EntityMeta {}
