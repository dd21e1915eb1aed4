//! Role and group definitions for multi-agent runs.
//!
//! A role is a system prompt plus a tool policy; a group is an ordered list
//! of role-bound member instances driven by the serial orchestrator.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Declarative agent role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSpec {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
    /// The lead role synthesizes the group's final answer and may
    /// short-circuit a round with the final marker.
    #[serde(default)]
    pub lead: bool,
}

impl RoleSpec {
    pub fn new(id: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            system_prompt: system_prompt.into(),
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            lead: false,
        }
    }

    pub fn with_allowed(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self
    }

    pub fn with_denied(mut self, tools: Vec<String>) -> Self {
        self.denied_tools = tools;
        self
    }

    pub fn as_lead(mut self) -> Self {
        self.lead = true;
        self
    }
}

/// One member slot of a group: a role bound to an agent instance id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub role_id: String,
    pub instance_id: String,
}

impl GroupMember {
    pub fn new(role_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            role_id: role_id.into(),
            instance_id: instance_id.into(),
        }
    }
}

/// An ordered team of roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSpec {
    pub id: String,
    pub name: String,
    pub members: Vec<GroupMember>,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

fn default_max_rounds() -> u32 {
    3
}

impl GroupSpec {
    pub fn new(id: impl Into<String>, members: Vec<GroupMember>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            members,
            max_rounds: default_max_rounds(),
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }
}

/// In-process registry of roles and groups.
#[derive(Default)]
pub struct GroupRegistry {
    roles: RwLock<HashMap<String, RoleSpec>>,
    groups: RwLock<HashMap<String, GroupSpec>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_role(&self, role: RoleSpec) {
        let mut roles = match self.roles.write() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        roles.insert(role.id.clone(), role);
    }

    pub fn register_group(&self, group: GroupSpec) {
        let mut groups = match self.groups.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        groups.insert(group.id.clone(), group);
    }

    pub fn role(&self, id: &str) -> Option<RoleSpec> {
        self.roles.read().ok().and_then(|r| r.get(id).cloned())
    }

    pub fn group(&self, id: &str) -> Option<GroupSpec> {
        self.groups.read().ok().and_then(|g| g.get(id).cloned())
    }
}
