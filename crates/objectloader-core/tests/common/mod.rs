//! Shared fixtures for objectloader-core integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use objectloader_core::{Base, Fetcher, Item, LoaderError};

/// Root with two levels of descendants: 3 children, 2 grandchildren
pub fn sample_graph() -> Vec<Base> {
    vec![
        Base::new("root", "Speckle.Core.Models.Collection").with_closure([
            ("wall", 1),
            ("floor", 1),
            ("roof", 1),
            ("mesh-a", 2),
            ("mesh-b", 2),
        ]),
        Base::new("wall", "Objects.BuiltElements.Wall"),
        Base::new("floor", "Objects.BuiltElements.Floor"),
        Base::new("roof", "Objects.BuiltElements.Roof"),
        Base::new("mesh-a", "Objects.Geometry.Mesh"),
        Base::new("mesh-b", "Objects.Geometry.Mesh"),
    ]
}

/// In-memory origin that can be told to fail specific ids
#[derive(Default)]
pub struct FakeOrigin {
    objects: HashMap<String, Base>,
    failing: HashSet<String>,
    batch_calls: Mutex<Vec<Vec<String>>>,
    single_calls: Mutex<Vec<String>>,
}

impl FakeOrigin {
    pub fn new(objects: Vec<Base>) -> Self {
        Self {
            objects: objects.into_iter().map(|b| (b.id.clone(), b)).collect(),
            ..Default::default()
        }
    }

    pub fn failing(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    /// Every id sent to the origin through batch requests, in order
    pub fn batched_ids(&self) -> Vec<String> {
        self.batch_calls.lock().iter().flatten().cloned().collect()
    }

    pub fn single_calls(&self) -> Vec<String> {
        self.single_calls.lock().clone()
    }
}

#[async_trait]
impl Fetcher for FakeOrigin {
    async fn fetch_single(&self, base_id: &str) -> Result<Item, LoaderError> {
        self.single_calls.lock().push(base_id.to_string());
        if self.failing.contains(base_id) {
            return Err(LoaderError::fetch(base_id, "simulated failure"));
        }
        self.objects
            .get(base_id)
            .map(|b| Item::new(b.clone()))
            .ok_or_else(|| LoaderError::not_found(base_id))
    }

    async fn fetch_batch(&self, base_ids: &[String]) -> Result<Vec<Item>, LoaderError> {
        self.batch_calls.lock().push(base_ids.to_vec());
        Ok(base_ids
            .iter()
            .filter(|id| !self.failing.contains(*id))
            .filter_map(|id| self.objects.get(id))
            .map(|b| Item::new(b.clone()))
            .collect())
    }
}
