use std::collections::HashMap;

use crate::ai::types::ToolCatalogEntry;
use crate::skills::SkillCatalog;

use super::traits::{ToolSource, ToolSpec};

/// Prefix applied to a discovered external tool whose sanitized name would
/// shadow a builtin.
pub const EXTERNAL_PREFIX: &str = "ext__";

/// Central registry of tool specs, built at router construction and
/// refreshed on external discovery.
pub struct ToolRegistry {
    tools: HashMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.  Overwrites any previous tool with the same name.
    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name.clone(), spec);
    }

    /// Register a discovered external tool.
    ///
    /// The name is sanitized; if the result collides with a builtin it gets
    /// [`EXTERNAL_PREFIX`] prepended.  Returns the name it was stored under.
    pub fn register_external(&mut self, mut spec: ToolSpec) -> String {
        spec.source = ToolSource::External;
        let mut name = sanitize_name(&spec.name);
        let shadows_builtin = self
            .tools
            .get(&name)
            .is_some_and(|existing| existing.source == ToolSource::Builtin);
        if shadows_builtin {
            name = format!("{EXTERNAL_PREFIX}{name}");
        }
        spec.name = name.clone();
        self.tools.insert(name.clone(), spec);
        name
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// Drop every external tool (before a discovery refresh).
    pub fn clear_external(&mut self) {
        self.tools.retain(|_, spec| spec.source == ToolSource::Builtin);
    }

    /// The catalog advertised to the model, sorted by name for stable prompts.
    pub fn catalog(&self) -> Vec<ToolCatalogEntry> {
        let mut entries: Vec<ToolCatalogEntry> =
            self.tools.values().map(ToolSpec::catalog_entry).collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Re-stamp each tool's owning skill ids from the catalog.
    pub fn apply_skills(&mut self, skills: &SkillCatalog) {
        for spec in self.tools.values_mut() {
            spec.meta.skill_ids = skills.skills_for_tool(&spec.name);
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ToolSpec)> {
        self.tools.iter()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep `[a-zA-Z0-9_-]`, replace everything else with `_`.
fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
