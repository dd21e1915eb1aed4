//! Skills: declarative bundles of tools referenced by policy lists.

pub mod catalog;
pub mod tools;

pub use catalog::{SkillCatalog, SkillSpec};
pub use tools::{SkillsGetTool, SkillsListTool};
