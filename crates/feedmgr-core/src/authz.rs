//! Caller identity and permission checks.
//!
//! Every operation that needs an authorization decision takes a
//! [`CallerContext`] explicitly. Decisions come from an [`AccessController`];
//! [`PolicyAccessController`] answers them from a YAML policy.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FeedMgrError, Result};
use crate::types::{FeedId, Principal};

// ---------------------------------------------------------------------------
// CallerContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub user: Principal,
    pub groups: BTreeSet<Principal>,
}

impl CallerContext {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: Principal::new(user),
            groups: BTreeSet::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(Principal::new(group));
        self
    }

    /// The user followed by every group.
    pub fn principals(&self) -> impl Iterator<Item = &Principal> {
        std::iter::once(&self.user).chain(self.groups.iter())
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// System-wide actions, checked against the services scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAction {
    CreateFeeds,
    EditTemplates,
}

/// Actions checked against one entity (a feed or a category).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityAction {
    /// Create feeds inside a category.
    CreateFeed,
    /// Change a feed's definition.
    EditDetails,
    /// Start or stop a feed.
    EnableDisable,
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceAction::CreateFeeds => write!(f, "create_feeds"),
            ServiceAction::EditTemplates => write!(f, "edit_templates"),
        }
    }
}

impl fmt::Display for EntityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityAction::CreateFeed => write!(f, "create_feed"),
            EntityAction::EditDetails => write!(f, "edit_details"),
            EntityAction::EnableDisable => write!(f, "enable_disable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Feed(FeedId),
    Category(String),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Feed(id) => write!(f, "feed {id}"),
            Entity::Category(name) => write!(f, "category {name}"),
        }
    }
}

/// The actions a caller may perform on one entity.
#[derive(Debug, Clone)]
pub struct AllowedActions {
    entity: Entity,
    actions: BTreeSet<EntityAction>,
}

impl AllowedActions {
    pub fn new(entity: Entity, actions: BTreeSet<EntityAction>) -> Self {
        Self { entity, actions }
    }

    pub fn contains(&self, action: EntityAction) -> bool {
        self.actions.contains(&action)
    }

    pub fn check(&self, action: EntityAction) -> Result<()> {
        if self.contains(action) {
            Ok(())
        } else {
            Err(FeedMgrError::denied(action, &self.entity))
        }
    }
}

pub trait AccessController {
    /// Fails with `Authorization` unless the caller holds `action` system-wide.
    fn check_permission(&self, caller: &CallerContext, action: ServiceAction) -> Result<()>;

    fn allowed_actions(&self, caller: &CallerContext, entity: &Entity) -> Result<AllowedActions>;
}

// ---------------------------------------------------------------------------
// PermissionPolicy
// ---------------------------------------------------------------------------

type Grants<A> = BTreeMap<Principal, BTreeSet<A>>;

/// Static permission policy, usually loaded from `config.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionPolicy {
    /// Principals holding every permission.
    #[serde(default)]
    pub admins: BTreeSet<Principal>,
    #[serde(default)]
    pub services: Grants<ServiceAction>,
    /// category system name -> grants
    #[serde(default)]
    pub categories: BTreeMap<String, Grants<EntityAction>>,
    /// feed id -> grants
    #[serde(default)]
    pub feeds: BTreeMap<String, Grants<EntityAction>>,
}

pub struct PolicyAccessController {
    policy: PermissionPolicy,
}

impl PolicyAccessController {
    pub fn new(policy: PermissionPolicy) -> Self {
        Self { policy }
    }

    fn is_admin(&self, caller: &CallerContext) -> bool {
        caller.principals().any(|p| self.policy.admins.contains(p))
    }
}

fn collect<A: Ord + Copy>(grants: Option<&Grants<A>>, caller: &CallerContext) -> BTreeSet<A> {
    let Some(grants) = grants else {
        return BTreeSet::new();
    };
    caller
        .principals()
        .filter_map(|p| grants.get(p))
        .flat_map(|actions| actions.iter().copied())
        .collect()
}

impl AccessController for PolicyAccessController {
    fn check_permission(&self, caller: &CallerContext, action: ServiceAction) -> Result<()> {
        if self.is_admin(caller) || collect(Some(&self.policy.services), caller).contains(&action)
        {
            return Ok(());
        }
        tracing::debug!("{} denied {action} on services", caller.user);
        Err(FeedMgrError::denied(action, "services"))
    }

    fn allowed_actions(&self, caller: &CallerContext, entity: &Entity) -> Result<AllowedActions> {
        let actions = if self.is_admin(caller) {
            [
                EntityAction::CreateFeed,
                EntityAction::EditDetails,
                EntityAction::EnableDisable,
            ]
            .into()
        } else {
            match entity {
                Entity::Feed(id) => collect(self.policy.feeds.get(id.as_str()), caller),
                Entity::Category(name) => collect(self.policy.categories.get(name), caller),
            }
        };
        Ok(AllowedActions::new(entity.clone(), actions))
    }
}
