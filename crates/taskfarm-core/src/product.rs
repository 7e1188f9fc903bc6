//! Products: named artifacts that gate the tasks consuming them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Declaration of a product in a job definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDef {
    /// Product name, unique within a job.
    pub name: String,

    /// Must reside on the agent of its producers and consumers.
    #[serde(default)]
    pub local: bool,

    /// May be produced by several tasks jointly.
    #[serde(default)]
    pub combined: bool,

    /// Locator of a job input (a product no task produces).
    #[serde(default)]
    pub locator: Option<String>,
}

impl ProductDef {
    /// Create a plain (non-local, non-combined) product.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local: false,
            combined: false,
            locator: None,
        }
    }

    /// Builder method to mark the product local.
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Builder method to mark the product combined.
    pub fn combined(mut self) -> Self {
        self.combined = true;
        self
    }

    /// Builder method to set the locator of a job input.
    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }
}

/// Runtime state of a product within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Product {
    name: String,
    local: bool,
    combined: bool,
    producers: BTreeSet<String>,
    finished: BTreeSet<String>,
    available: bool,
    locator: Option<String>,
    locators: BTreeMap<String, String>,
}

impl Product {
    /// Create the runtime state for `def`, produced by `producers`.
    ///
    /// A product without producers is a job input and available at once.
    pub fn new(def: ProductDef, producers: BTreeSet<String>) -> Self {
        let available = producers.is_empty();
        Self {
            name: def.name,
            local: def.local,
            combined: def.combined,
            producers,
            finished: BTreeSet::new(),
            available,
            locator: def.locator,
            locators: BTreeMap::new(),
        }
    }

    /// Product name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true for local products.
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Returns true for combined products.
    pub fn is_combined(&self) -> bool {
        self.combined
    }

    /// Tasks that can produce this product.
    pub fn producers(&self) -> &BTreeSet<String> {
        &self.producers
    }

    /// Returns true if consumers may start.
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Locator of a non-combined product.
    pub fn locator(&self) -> Option<&str> {
        self.locator.as_deref()
    }

    /// Locators of a combined product, keyed by producer.
    pub fn locators(&self) -> &BTreeMap<String, String> {
        &self.locators
    }

    pub(crate) fn add_producer(&mut self, task: &str) {
        if self.producers.insert(task.to_string()) && !self.finished.contains(task) {
            self.available = false;
        }
    }

    /// Record that `task` finished, with the locator it reported (if any).
    ///
    /// Returns true if the product became available by this call.
    pub(crate) fn producer_finished(&mut self, task: &str, locator: Option<String>) -> bool {
        self.finished.insert(task.to_string());
        let was_available = self.available;

        if self.combined {
            if let Some(locator) = locator {
                self.locators.insert(task.to_string(), locator);
            }
            self.available = self.finished.is_superset(&self.producers);
        } else if self.available {
            // The first producer to deliver keeps the product; later writes
            // are ignored.
            if locator.is_some() {
                debug!(product = %self.name, task, "Ignoring second write to product");
            }
        } else if let Some(locator) = locator {
            self.locator = Some(locator);
            self.available = true;
        } else if self.finished.is_superset(&self.producers) {
            // No producer delivered; release the consumers anyway.
            self.available = true;
        }

        self.available && !was_available
    }
}
