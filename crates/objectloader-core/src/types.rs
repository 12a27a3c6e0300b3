//! Object graph data model
//!
//! A [`Base`] is one node of the content-addressed graph. Its `id` is a hash of
//! its content, so a given id always denotes the same bytes and a fetched base
//! never needs to be refreshed. An [`Item`] is the unit that moves through the
//! loading pipeline: a base plus the id it was requested under and an optional
//! byte-size hint.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A node of the design-data graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Base {
    /// Content hash; globally unique and immutable
    pub id: String,

    /// Node kind discriminator
    #[serde(default)]
    pub speckle_type: String,

    /// Descendant ids mapped to their relation weight (depth below this node)
    #[serde(
        rename = "__closure",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub closure: Option<BTreeMap<String, u64>>,

    /// Every other field, preserved verbatim
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl Base {
    /// Create a base with no closure and no extra properties
    pub fn new(id: impl Into<String>, speckle_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            speckle_type: speckle_type.into(),
            closure: None,
            properties: Map::new(),
        }
    }

    /// Attach a closure table
    pub fn with_closure<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        self.closure = Some(
            children
                .into_iter()
                .map(|(id, weight)| (id.into(), weight))
                .collect(),
        );
        self
    }

    /// Set an arbitrary property
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Ids reachable from this base, nearest descendants first.
    ///
    /// Ordered by ascending relation weight; ties are broken by id so the
    /// order is stable across runs.
    pub fn closure_ids(&self) -> Vec<String> {
        let Some(closure) = &self.closure else {
            return Vec::new();
        };
        let mut children: Vec<(&String, &u64)> = closure.iter().collect();
        children.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
        children.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Number of descendants recorded in the closure table
    pub fn closure_len(&self) -> usize {
        self.closure.as_ref().map_or(0, |c| c.len())
    }
}

/// A fetched unit of work.
#[derive(Debug, Clone)]
pub struct Item {
    /// The id this item was requested under
    pub base_id: String,
    /// The resolved base, shared between every consumer of the id
    pub base: Arc<Base>,
    /// Byte length of the encoded base, when known
    pub size: Option<usize>,
}

impl Item {
    /// Wrap an owned base; the id is taken from the base itself
    pub fn new(base: Base) -> Self {
        Self::from_shared(Arc::new(base))
    }

    /// Wrap an already shared base
    pub fn from_shared(base: Arc<Base>) -> Self {
        Self {
            base_id: base.id.clone(),
            base,
            size: None,
        }
    }

    /// Set the size hint
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Decode an item from the JSON text of its base.
    ///
    /// The size hint is the length of `json` in bytes.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let base: Base = serde_json::from_str(json)?;
        Ok(Self::new(base).with_size(json.len()))
    }

    /// Encode the base as JSON text
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self.base.as_ref())
    }
}

/// What the download side reports back for one requested id.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The id resolved to an item
    Found(Item),
    /// The id could not be fetched
    Missing {
        /// Requested id
        base_id: String,
        /// Human-readable reason
        reason: String,
    },
}

impl FetchOutcome {
    /// Build a not-found notice
    pub fn missing(base_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Missing {
            base_id: base_id.into(),
            reason: reason.into(),
        }
    }

    /// The id this outcome answers
    pub fn base_id(&self) -> &str {
        match self {
            Self::Found(item) => &item.base_id,
            Self::Missing { base_id, .. } => base_id,
        }
    }
}
