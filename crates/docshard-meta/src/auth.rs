//! Authorization collaborator.
//!
//! The coordinator does not decide who may do what. Every mutating admin
//! command asks an [`Authorizer`] first and fails with `Unauthorized` on
//! denial. [`GrantTable`] is a simple privilege table, granting actions on the
//! cluster, a whole database, or a single collection.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::types::{MetaError, Namespace};

/// Authenticated caller of an admin command.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// User name
    pub user: String,
    /// Database the user was defined in
    pub db: String,
}

impl Principal {
    /// Creates a new principal
    pub fn new(user: impl Into<String>, db: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            db: db.into(),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.db)
    }
}

/// Privileged actions exposed by the admin surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    /// enableSharding on a database
    EnableSharding,
    /// shardCollection
    ShardCollection,
    /// split
    SplitChunk,
    /// moveChunk
    MoveChunk,
    /// balancerStart / balancerStop / balancer rounds
    ManageBalancer,
    /// drop of a sharded collection
    DropCollection,
    /// zone membership and zone key ranges
    ManageZones,
    /// adding shards to the inventory
    AddShard,
    /// read-only status queries
    ViewStatus,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionType::EnableSharding => "enableSharding",
            ActionType::ShardCollection => "shardCollection",
            ActionType::SplitChunk => "splitChunk",
            ActionType::MoveChunk => "moveChunk",
            ActionType::ManageBalancer => "manageBalancer",
            ActionType::DropCollection => "dropCollection",
            ActionType::ManageZones => "manageZones",
            ActionType::AddShard => "addShard",
            ActionType::ViewStatus => "viewStatus",
        };
        f.write_str(name)
    }
}

/// Target of an action.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    /// Cluster-wide resource (balancer, shard inventory)
    Cluster,
    /// Every collection of a database
    Database(String),
    /// One collection
    Collection(Namespace),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Cluster => f.write_str("cluster"),
            Resource::Database(db) => write!(f, "database {}", db),
            Resource::Collection(ns) => write!(f, "collection {}", ns),
        }
    }
}

/// Capability check consulted before each mutating command.
pub trait Authorizer: Send + Sync {
    /// Returns true if `principal` may perform `action` on `resource`.
    fn is_authorized(&self, principal: &Principal, action: ActionType, resource: &Resource) -> bool;

    /// Like `is_authorized`, but returns `Unauthorized` on denial.
    fn check(
        &self,
        principal: &Principal,
        action: ActionType,
        resource: &Resource,
    ) -> Result<(), MetaError> {
        if self.is_authorized(principal, action, resource) {
            Ok(())
        } else {
            tracing::debug!(%principal, %action, %resource, "authorization denied");
            Err(MetaError::Unauthorized {
                action: action.to_string(),
                resource: resource.to_string(),
            })
        }
    }
}

/// Authorizer that permits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_authorized(&self, _: &Principal, _: ActionType, _: &Resource) -> bool {
        true
    }
}

/// A granted privilege: a set of actions on a resource.
///
/// A database grant covers every collection in it; a cluster grant covers
/// everything.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Privilege {
    /// Resource the grant applies to
    pub resource: Resource,
    /// Granted actions
    pub actions: Vec<ActionType>,
}

impl Privilege {
    fn covers(&self, action: ActionType, resource: &Resource) -> bool {
        if !self.actions.contains(&action) {
            return false;
        }
        match (&self.resource, resource) {
            (Resource::Cluster, _) => true,
            (Resource::Database(db), Resource::Database(target)) => db == target,
            (Resource::Database(db), Resource::Collection(ns)) => *db == ns.db,
            (Resource::Collection(ns), Resource::Collection(target)) => ns == target,
            _ => false,
        }
    }
}

/// Privilege table keyed by principal.
#[derive(Default)]
pub struct GrantTable {
    grants: RwLock<HashMap<Principal, Vec<Privilege>>>,
}

impl GrantTable {
    /// Creates an empty table; every check is denied until grants are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a privilege for a principal.
    pub fn grant(&self, principal: Principal, privilege: Privilege) {
        if let Ok(mut grants) = self.grants.write() {
            grants.entry(principal).or_default().push(privilege);
        }
    }

    /// Removes every privilege of a principal on `resource`.
    pub fn revoke(&self, principal: &Principal, resource: &Resource) {
        if let Ok(mut grants) = self.grants.write() {
            if let Some(list) = grants.get_mut(principal) {
                list.retain(|p| &p.resource != resource);
            }
        }
    }
}

impl Authorizer for GrantTable {
    fn is_authorized(&self, principal: &Principal, action: ActionType, resource: &Resource) -> bool {
        self.grants
            .read()
            .ok()
            .and_then(|g| {
                g.get(principal)
                    .map(|list| list.iter().any(|p| p.covers(action, resource)))
            })
            .unwrap_or(false)
    }
}
