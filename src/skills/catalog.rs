//! Declarative skill bundles: a skill maps an id to the set of tools it
//! grants.  Policy allow/deny lists may reference skills as `skill:<id>`.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// One skill definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillSpec {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Names of the tools this skill bundles.
    pub tools: Vec<String>,
}

impl SkillSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            tools: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }
}

/// Central, refreshable index of skills.
#[derive(Default)]
pub struct SkillCatalog {
    skills: RwLock<HashMap<String, SkillSpec>>,
}

impl SkillCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: SkillSpec) {
        let mut skills = match self.skills.write() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        skills.insert(spec.id.clone(), spec);
    }

    /// Replace the whole catalog (discovery refresh).
    pub fn replace_all(&self, specs: Vec<SkillSpec>) {
        let mut skills = match self.skills.write() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        skills.clear();
        for spec in specs {
            skills.insert(spec.id.clone(), spec);
        }
        log::info!("skill catalog refreshed: {} skill(s)", skills.len());
    }

    pub fn get(&self, id: &str) -> Option<SkillSpec> {
        self.skills
            .read()
            .ok()
            .and_then(|s| s.get(id).cloned())
    }

    /// All skills, sorted by id.
    pub fn list(&self) -> Vec<SkillSpec> {
        let mut all: Vec<SkillSpec> = self
            .skills
            .read()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Ids of every skill bundling `tool_name`.
    pub fn skills_for_tool(&self, tool_name: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .skills
            .read()
            .map(|s| {
                s.values()
                    .filter(|spec| spec.tools.iter().any(|t| t == tool_name))
                    .map(|spec| spec.id.clone())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.skills.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
