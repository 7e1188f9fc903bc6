//! Resource requirements and the pool of concrete resources.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::{ConnectionStatus, ResourceId};

/// Reserved reference naming the agent requirement of a claim.
pub const AGENT_REF: &str = "agent";

/// Resource type of execution agents.
pub const AGENT_TYPE: &str = "agent";

/// One named resource requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Reference name, unique within a claim.
    pub reference: String,

    /// Type of resource required.
    #[serde(rename = "type")]
    pub res_type: String,

    /// Capabilities the resource must have.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl ResourceSpec {
    /// Create a new spec.
    pub fn new<I, S>(reference: impl Into<String>, res_type: impl Into<String>, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reference: reference.into(),
            res_type: res_type.into(),
            capabilities: caps.into_iter().map(Into::into).collect(),
        }
    }

    /// Create the agent spec of a claim.
    pub fn agent<I, S>(caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(AGENT_REF, AGENT_TYPE, caps)
    }

    /// Returns true for the agent requirement.
    pub fn is_agent(&self) -> bool {
        self.reference == AGENT_REF
    }
}

/// Ordered set of resource requirements of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ResourceSpec>", into = "Vec<ResourceSpec>")]
pub struct ResourceClaim {
    specs: Vec<ResourceSpec>,
}

impl ResourceClaim {
    /// Build a claim, validating that references are unique and that exactly
    /// one spec is the agent requirement.
    pub fn new(specs: Vec<ResourceSpec>) -> Result<Self> {
        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.reference.as_str()) {
                return Err(CoreError::InvalidClaim(format!(
                    "duplicate reference '{}'",
                    spec.reference
                )));
            }
            if spec.is_agent() != (spec.res_type == AGENT_TYPE) {
                return Err(CoreError::InvalidClaim(format!(
                    "reference '{}' must be used exactly for resource type '{AGENT_TYPE}'",
                    AGENT_REF
                )));
            }
        }
        if !seen.contains(AGENT_REF) {
            return Err(CoreError::InvalidClaim(format!(
                "claim has no '{AGENT_REF}' requirement"
            )));
        }
        Ok(Self { specs })
    }

    /// Claim with only an agent requirement.
    pub fn agent_only<I, S>(caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            specs: vec![ResourceSpec::agent(caps)],
        }
    }

    /// Builder method to add a non-agent requirement.
    pub fn with_spec(mut self, spec: ResourceSpec) -> Result<Self> {
        self.specs.push(spec);
        Self::new(self.specs)
    }

    /// All specs in claim order.
    pub fn specs(&self) -> &[ResourceSpec] {
        &self.specs
    }

    /// The agent requirement.
    pub fn agent_spec(&self) -> &ResourceSpec {
        // Construction guarantees the agent spec is present.
        self.specs
            .iter()
            .find(|s| s.is_agent())
            .unwrap_or_else(|| unreachable!("claim without agent spec"))
    }

    /// Capabilities required of the agent.
    pub fn agent_capabilities(&self) -> &BTreeSet<String> {
        &self.agent_spec().capabilities
    }

    /// Requirements other than the agent.
    pub fn non_agent_specs(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.specs.iter().filter(|s| !s.is_agent())
    }

    /// Look up a spec by reference.
    pub fn get(&self, reference: &str) -> Option<&ResourceSpec> {
        self.specs.iter().find(|s| s.reference == reference)
    }
}

impl Default for ResourceClaim {
    fn default() -> Self {
        Self::agent_only(Vec::<String>::new())
    }
}

impl TryFrom<Vec<ResourceSpec>> for ResourceClaim {
    type Error = CoreError;

    fn try_from(specs: Vec<ResourceSpec>) -> Result<Self> {
        Self::new(specs)
    }
}

impl From<ResourceClaim> for Vec<ResourceSpec> {
    fn from(claim: ResourceClaim) -> Self {
        claim.specs
    }
}

/// Why a resource can or cannot be handed out right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Free to reserve.
    Free,
    /// Reserved by some owner.
    Reserved,
    /// Administratively suspended.
    Suspended,
    /// Connection is not healthy.
    Disconnected,
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Reserved => write!(f, "busy"),
            Self::Suspended => write!(f, "suspended"),
            Self::Disconnected => write!(f, "lost"),
        }
    }
}

/// A concrete allocatable resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique resource identifier.
    pub id: ResourceId,

    /// Resource type.
    #[serde(rename = "type")]
    pub res_type: String,

    /// Capabilities offered.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// Where the resource can be reached; handed to agents on assignment.
    #[serde(default)]
    pub locator: String,

    /// Whether the resource is administratively suspended.
    #[serde(default)]
    pub suspended: bool,

    /// Connection status.
    #[serde(default = "connected")]
    pub connection: ConnectionStatus,

    /// Current reservation owner.
    #[serde(skip_deserializing)]
    reserved_by: Option<String>,
}

fn connected() -> ConnectionStatus {
    ConnectionStatus::Connected
}

impl Resource {
    /// Create a new connected, unreserved resource.
    pub fn new<I, S>(id: impl Into<ResourceId>, res_type: impl Into<String>, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            res_type: res_type.into(),
            capabilities: caps.into_iter().map(Into::into).collect(),
            locator: String::new(),
            suspended: false,
            connection: ConnectionStatus::Connected,
            reserved_by: None,
        }
    }

    /// Builder method to set the locator.
    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = locator.into();
        self
    }

    /// Matching cost: resources with fewer capabilities are preferred.
    pub fn cost(&self) -> usize {
        self.capabilities.len()
    }

    /// Returns true if this resource satisfies the spec's type and capabilities.
    pub fn satisfies(&self, spec: &ResourceSpec) -> bool {
        self.res_type == spec.res_type && self.capabilities.is_superset(&spec.capabilities)
    }

    /// Current reservation owner.
    pub fn reserved_by(&self) -> Option<&str> {
        self.reserved_by.as_deref()
    }

    /// Whether this resource can be handed out now.
    pub fn availability(&self) -> Availability {
        if self.suspended {
            Availability::Suspended
        } else if !self.connection.is_healthy() {
            Availability::Disconnected
        } else if self.reserved_by.is_some() {
            Availability::Reserved
        } else {
            Availability::Free
        }
    }

    /// Returns true if the resource is free to reserve.
    pub fn is_free(&self) -> bool {
        self.availability() == Availability::Free
    }
}

/// The pool of concrete resources, agents included.
#[derive(Debug, Default)]
pub struct ResourcePool {
    resources: BTreeMap<ResourceId, Resource>,
}

impl ResourcePool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource. Ids must be unique.
    pub fn add(&mut self, resource: Resource) -> Result<()> {
        if self.resources.contains_key(&resource.id) {
            return Err(CoreError::InvalidInput(format!(
                "resource {} already exists",
                resource.id
            )));
        }
        self.resources.insert(resource.id.clone(), resource);
        Ok(())
    }

    /// Remove a resource, returning it.
    pub fn remove(&mut self, id: &ResourceId) -> Option<Resource> {
        self.resources.remove(id)
    }

    /// Look up a resource.
    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.resources.get(id)
    }

    /// Look up a resource for modification.
    pub fn get_mut(&mut self, id: &ResourceId) -> Option<&mut Resource> {
        self.resources.get_mut(id)
    }

    /// Iterate over all resources in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    /// Iterate over the resources of one type in id order.
    pub fn of_type<'a>(&'a self, res_type: &'a str) -> impl Iterator<Item = &'a Resource> + 'a {
        self.resources.values().filter(move |r| r.res_type == res_type)
    }

    /// Number of resources.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Reserve a resource for `owner`.
    ///
    /// Reserving a resource already held by a different owner is an internal
    /// inconsistency and fails loudly.
    pub fn reserve(&mut self, id: &ResourceId, owner: &str) -> Result<()> {
        let resource = self
            .resources
            .get_mut(id)
            .ok_or_else(|| CoreError::ResourceNotFound(id.clone()))?;
        match &resource.reserved_by {
            Some(current) if current != owner => Err(CoreError::DuplicateReservation {
                resource: id.clone(),
                owner: current.clone(),
            }),
            _ => {
                resource.reserved_by = Some(owner.to_string());
                Ok(())
            }
        }
    }

    /// Release a reservation held by `owner`.
    ///
    /// Releasing a resource that was deleted meanwhile is tolerated.
    pub fn release(&mut self, id: &ResourceId, owner: &str) -> Result<()> {
        let Some(resource) = self.resources.get_mut(id) else {
            warn!(resource_id = %id, owner, "Releasing reservation of deleted resource");
            return Ok(());
        };
        match &resource.reserved_by {
            Some(current) if current == owner => {
                resource.reserved_by = None;
                Ok(())
            }
            Some(current) => Err(CoreError::DuplicateReservation {
                resource: id.clone(),
                owner: current.clone(),
            }),
            None => {
                warn!(resource_id = %id, owner, "Releasing resource that was not reserved");
                Ok(())
            }
        }
    }
}
