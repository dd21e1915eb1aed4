use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::runs::Scope;

// ─── Public types ──────────────────────────────────────────────────────────

/// Risk tier of a tool, declared in its registry metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

impl RiskLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            _ => None,
        }
    }
}

/// Tri-valued policy outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    Ask,
}

impl Decision {
    /// Severity for the delegated-intersection rule: deny > ask > allow.
    fn severity(self) -> u8 {
        match self {
            Decision::Allow => 0,
            Decision::Ask => 1,
            Decision::Deny => 2,
        }
    }
}

/// A decision plus the reason it was reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub decision: Decision,
    pub reason: String,
}

impl PolicyDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Allow,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            reason: reason.into(),
        }
    }

    fn ask(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Ask,
            reason: reason.into(),
        }
    }
}

/// Tool permissions delegated from a parent run to a child.
///
/// Entries may use glob wildcards: `*` matches within a `.`/`:` segment,
/// `**` matches across segments.  A `skill:<id>` entry covers every tool
/// bundled by that skill.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedPermissions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_tools: Option<Vec<String>>,
}

impl DelegatedPermissions {
    /// Narrow `self` by a requested set for a child run.  Denies are unioned;
    /// a requested allow-list is filtered through the parent's allow-list so
    /// that permissions are never broadened.
    pub fn narrow(&self, requested: Option<&DelegatedPermissions>) -> DelegatedPermissions {
        let Some(req) = requested else {
            return self.clone();
        };

        let mut denied = self.denied_tools.clone().unwrap_or_default();
        if let Some(extra) = &req.denied_tools {
            for d in extra {
                if !denied.contains(d) {
                    denied.push(d.clone());
                }
            }
        }

        let allowed = match (&self.allowed_tools, &req.allowed_tools) {
            (Some(parent), Some(req)) => Some(
                req.iter()
                    .filter(|name| parent.iter().any(|pat| glob_match(pat, name)))
                    .cloned()
                    .collect::<Vec<_>>(),
            ),
            (Some(parent), None) => Some(parent.clone()),
            (None, Some(req)) => Some(req.clone()),
            (None, None) => None,
        };

        DelegatedPermissions {
            allowed_tools: allowed,
            denied_tools: if denied.is_empty() { None } else { Some(denied) },
        }
    }
}

/// Per-call capability bundle handed to the tool router.
///
/// The router itself is immutable after construction; everything that was
/// "current run" state in older designs rides here instead.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub run_id: String,
    pub session_key: String,
    pub scope: Scope,
    pub agent_id: String,
    pub role_id: Option<String>,
    pub allowed_tools: Vec<String>,
    pub denied_tools: Vec<String>,
    pub delegated: Option<DelegatedPermissions>,
}

impl AgentContext {
    pub fn new(
        run_id: impl Into<String>,
        session_key: impl Into<String>,
        scope: Scope,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            session_key: session_key.into(),
            scope,
            agent_id: agent_id.into(),
            role_id: None,
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            delegated: None,
        }
    }

    pub fn with_role(mut self, role_id: impl Into<String>) -> Self {
        self.role_id = Some(role_id.into());
        self
    }

    pub fn with_allowed(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self
    }

    pub fn with_denied(mut self, tools: Vec<String>) -> Self {
        self.denied_tools = tools;
        self
    }

    pub fn with_delegated(mut self, delegated: Option<DelegatedPermissions>) -> Self {
        self.delegated = delegated;
        self
    }
}

/// One entry in the policy's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub run_id: String,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub risk_level: RiskLevel,
    pub decision: String,
    pub reason: Option<String>,
}

// ─── ToolPolicy ────────────────────────────────────────────────────────────

/// Decides allow/deny/ask per (agent context, tool metadata).
///
/// Shared across runs via `Arc<ToolPolicy>`; the audit log is the only
/// mutable state and sits behind an interior `Mutex`.
pub struct ToolPolicy {
    /// Discovery tools that bypass every other rule.
    always_allowed: Vec<String>,
    action_log: Mutex<Vec<AuditEntry>>,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self::new(vec!["skills_list".to_string(), "skills_get".to_string()])
    }
}

impl ToolPolicy {
    pub fn new(always_allowed: Vec<String>) -> Self {
        Self {
            always_allowed,
            action_log: Mutex::new(Vec::new()),
        }
    }

    /// Evaluate the policy for one tool call.
    ///
    /// `skill_ids` lists every skill the tool belongs to.  When delegated
    /// permissions are present, the outcome is the intersection of the
    /// role-level and delegated decisions (deny > ask > allow).
    pub fn evaluate(
        &self,
        ctx: &AgentContext,
        tool_name: &str,
        risk: RiskLevel,
        skill_ids: &[String],
    ) -> PolicyDecision {
        let role = self.role_decision(ctx, tool_name, risk, skill_ids);
        match &ctx.delegated {
            None => role,
            Some(delegated) => {
                let scoped = self.delegated_decision(delegated, tool_name, risk, skill_ids);
                strictest(role, scoped)
            }
        }
    }

    fn role_decision(
        &self,
        ctx: &AgentContext,
        tool_name: &str,
        risk: RiskLevel,
        skill_ids: &[String],
    ) -> PolicyDecision {
        if self.always_allowed.iter().any(|t| t == tool_name) {
            return PolicyDecision::allow("discovery tool");
        }

        // A tool denied by name or through any of its skills is out,
        // regardless of allow-lists (any denying skill wins).
        let denied_by_skill = skill_ids
            .iter()
            .any(|s| ctx.denied_tools.iter().any(|d| d == &format!("skill:{s}")));
        if ctx.denied_tools.iter().any(|d| d == tool_name) || denied_by_skill {
            return PolicyDecision::deny(format!("tool '{tool_name}' is explicitly denied"));
        }

        if !ctx.allowed_tools.is_empty() {
            let allowed_by_name = ctx.allowed_tools.iter().any(|a| a == tool_name);
            let allowed_by_skill = skill_ids.iter().any(|s| {
                ctx.allowed_tools
                    .iter()
                    .any(|a| a == s || a == &format!("skill:{s}"))
            });
            if !allowed_by_name && !allowed_by_skill {
                return PolicyDecision::deny(format!(
                    "tool '{tool_name}' is not in the allowed list"
                ));
            }
        }

        if risk == RiskLevel::High {
            return PolicyDecision::ask("high risk");
        }

        PolicyDecision::allow("permitted")
    }

    fn delegated_decision(
        &self,
        delegated: &DelegatedPermissions,
        tool_name: &str,
        risk: RiskLevel,
        skill_ids: &[String],
    ) -> PolicyDecision {
        if self.always_allowed.iter().any(|t| t == tool_name) {
            return PolicyDecision::allow("discovery tool");
        }

        if let Some(denied) = &delegated.denied_tools {
            let hit = denied.iter().any(|pat| {
                glob_match(pat, tool_name)
                    || skill_ids
                        .iter()
                        .any(|s| glob_match(pat, &format!("skill:{s}")))
            });
            if hit {
                return PolicyDecision::deny(format!(
                    "tool '{tool_name}' is explicitly denied by delegated permissions"
                ));
            }
        }

        if let Some(allowed) = &delegated.allowed_tools
            && !allowed.is_empty()
        {
            let hit = allowed.iter().any(|pat| {
                glob_match(pat, tool_name)
                    || skill_ids.iter().any(|s| {
                        glob_match(pat, s) || glob_match(pat, &format!("skill:{s}"))
                    })
            });
            if !hit {
                return PolicyDecision::deny(format!(
                    "tool '{tool_name}' is not in the delegated allowed list"
                ));
            }
        }

        if risk == RiskLevel::High {
            return PolicyDecision::ask("high risk");
        }

        PolicyDecision::allow("permitted by delegation")
    }

    // ── Audit ────────────────────────────────────────────────────────────

    /// Append an entry to the in-memory audit log.
    pub fn log_action(
        &self,
        run_id: &str,
        tool_name: &str,
        args: serde_json::Value,
        risk_level: RiskLevel,
        decision: &str,
        reason: Option<&str>,
    ) {
        let entry = AuditEntry {
            timestamp: chrono::Utc::now(),
            run_id: run_id.to_string(),
            tool_name: tool_name.to_string(),
            args,
            risk_level,
            decision: decision.to_string(),
            reason: reason.map(str::to_string),
        };
        let mut log = match self.action_log.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        log.push(entry);
    }

    /// Return a snapshot of the audit log (newest last).
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        match self.action_log.lock() {
            Ok(l) => l.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Intersection rule: the stricter outcome wins; on a tie the role-level
/// reason is kept.
fn strictest(role: PolicyDecision, delegated: PolicyDecision) -> PolicyDecision {
    if delegated.decision.severity() > role.decision.severity() {
        delegated
    } else {
        role
    }
}

// ─── Glob matching ──────────────────────────────────────────────────────────

/// Match `name` against a glob `pattern` where `*` stays within a `.`/`:`
/// segment and `**` crosses segments.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    if pattern == name {
        return true;
    }
    if !pattern.contains('*') {
        return false;
    }
    let mut regex_str = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    regex_str.push_str(".*");
                } else {
                    regex_str.push_str("[^.:]*");
                }
            }
            other => regex_str.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex_str.push('$');
    regex::Regex::new(&regex_str)
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope {
            org_id: "org-1".to_string(),
            user_id: "user-1".to_string(),
            project_id: None,
        }
    }

    fn ctx() -> AgentContext {
        AgentContext::new("run-1", "sess-1", scope(), "main")
    }

    fn policy() -> ToolPolicy {
        ToolPolicy::default()
    }

    // ── Precedence ──────────────────────────────────────────────────────

    #[test]
    fn discovery_tools_always_allowed() {
        let ctx = ctx().with_denied(vec!["skills_list".to_string()]);
        let d = policy().evaluate(&ctx, "skills_list", RiskLevel::High, &[]);
        assert_eq!(d.decision, Decision::Allow);
    }

    #[test]
    fn denied_by_name_wins_over_allowed() {
        let ctx = ctx()
            .with_allowed(vec!["memory_write".to_string()])
            .with_denied(vec!["memory_write".to_string()]);
        let d = policy().evaluate(&ctx, "memory_write", RiskLevel::Low, &[]);
        assert_eq!(d.decision, Decision::Deny);
        assert!(d.reason.contains("explicitly denied"));
    }

    #[test]
    fn denied_by_skill_wins() {
        let ctx = ctx().with_denied(vec!["skill:web".to_string()]);
        let d = policy().evaluate(&ctx, "web_fetch", RiskLevel::Low, &["web".to_string()]);
        assert_eq!(d.decision, Decision::Deny);
        assert!(d.reason.contains("explicitly denied"));
    }

    #[test]
    fn any_denying_skill_wins_for_multi_skill_tools() {
        let ctx = ctx()
            .with_allowed(vec!["skill:search".to_string()])
            .with_denied(vec!["skill:web".to_string()]);
        let skills = vec!["search".to_string(), "web".to_string()];
        let d = policy().evaluate(&ctx, "web_fetch", RiskLevel::Low, &skills);
        assert_eq!(d.decision, Decision::Deny);
    }

    #[test]
    fn allow_list_excludes_unlisted_tool() {
        let ctx = ctx().with_allowed(vec!["memory_search".to_string()]);
        let d = policy().evaluate(&ctx, "memory_write", RiskLevel::Low, &[]);
        assert_eq!(d.decision, Decision::Deny);
        assert!(d.reason.contains("not in the allowed list"));
    }

    #[test]
    fn allow_list_admits_by_bare_skill_id() {
        let ctx = ctx().with_allowed(vec!["web".to_string()]);
        let d = policy().evaluate(&ctx, "web_fetch", RiskLevel::Low, &["web".to_string()]);
        assert_eq!(d.decision, Decision::Allow);
    }

    #[test]
    fn allow_list_admits_by_prefixed_skill_id() {
        let ctx = ctx().with_allowed(vec!["skill:web".to_string()]);
        let d = policy().evaluate(&ctx, "web_fetch", RiskLevel::Low, &["web".to_string()]);
        assert_eq!(d.decision, Decision::Allow);
    }

    #[test]
    fn empty_allow_list_is_unrestricted() {
        let d = policy().evaluate(&ctx(), "memory_write", RiskLevel::Medium, &[]);
        assert_eq!(d.decision, Decision::Allow);
    }

    #[test]
    fn high_risk_asks() {
        let d = policy().evaluate(&ctx(), "exec_command", RiskLevel::High, &[]);
        assert_eq!(d.decision, Decision::Ask);
        assert!(d.reason.contains("high risk"));
    }

    #[test]
    fn allowed_high_risk_still_asks() {
        let ctx = ctx().with_allowed(vec!["exec_command".to_string()]);
        let d = policy().evaluate(&ctx, "exec_command", RiskLevel::High, &[]);
        assert_eq!(d.decision, Decision::Ask);
    }

    // ── Delegated intersection ──────────────────────────────────────────

    #[test]
    fn delegated_deny_overrides_role_allow() {
        let ctx = ctx().with_delegated(Some(DelegatedPermissions {
            allowed_tools: None,
            denied_tools: Some(vec!["memory_*".to_string()]),
        }));
        let d = policy().evaluate(&ctx, "memory_write", RiskLevel::Low, &[]);
        assert_eq!(d.decision, Decision::Deny);
        assert!(d.reason.contains("delegated"));
    }

    #[test]
    fn delegated_allow_list_filters() {
        let ctx = ctx().with_delegated(Some(DelegatedPermissions {
            allowed_tools: Some(vec!["memory_search".to_string()]),
            denied_tools: None,
        }));
        let allowed = policy().evaluate(&ctx, "memory_search", RiskLevel::Low, &[]);
        assert_eq!(allowed.decision, Decision::Allow);
        let denied = policy().evaluate(&ctx, "memory_write", RiskLevel::Low, &[]);
        assert_eq!(denied.decision, Decision::Deny);
    }

    #[test]
    fn delegated_ask_beats_role_allow() {
        // High risk asks in both evaluations; intersection keeps ask.
        let ctx = ctx().with_delegated(Some(DelegatedPermissions::default()));
        let d = policy().evaluate(&ctx, "exec_command", RiskLevel::High, &[]);
        assert_eq!(d.decision, Decision::Ask);
    }

    #[test]
    fn role_deny_survives_delegated_allow() {
        let ctx = ctx()
            .with_denied(vec!["exec_command".to_string()])
            .with_delegated(Some(DelegatedPermissions {
                allowed_tools: Some(vec!["exec_command".to_string()]),
                denied_tools: None,
            }));
        let d = policy().evaluate(&ctx, "exec_command", RiskLevel::Low, &[]);
        assert_eq!(d.decision, Decision::Deny);
    }

    #[test]
    fn delegated_glob_double_star_crosses_segments() {
        let ctx = ctx().with_delegated(Some(DelegatedPermissions {
            allowed_tools: None,
            denied_tools: Some(vec!["skill:**".to_string()]),
        }));
        let d = policy().evaluate(&ctx, "web_fetch", RiskLevel::Low, &["web.search".to_string()]);
        assert_eq!(d.decision, Decision::Deny);
    }

    // ── Glob matcher ────────────────────────────────────────────────────

    #[test]
    fn glob_exact() {
        assert!(glob_match("memory_search", "memory_search"));
        assert!(!glob_match("memory_search", "memory_write"));
    }

    #[test]
    fn glob_single_star_within_segment() {
        assert!(glob_match("memory_*", "memory_search"));
        assert!(glob_match("mem*", "memory_write"));
        assert!(!glob_match("skill:*", "skill:web.fetch"));
    }

    #[test]
    fn glob_double_star_across_segments() {
        assert!(glob_match("skill:**", "skill:web.fetch"));
        assert!(glob_match("**", "anything:at.all"));
    }

    // ── Narrowing ───────────────────────────────────────────────────────

    #[test]
    fn narrow_unions_denies_and_filters_allows() {
        let parent = DelegatedPermissions {
            allowed_tools: Some(vec!["memory_*".to_string()]),
            denied_tools: Some(vec!["exec_command".to_string()]),
        };
        let requested = DelegatedPermissions {
            allowed_tools: Some(vec![
                "memory_search".to_string(),
                "web_fetch".to_string(), // outside the parent grant
            ]),
            denied_tools: Some(vec!["memory_write".to_string()]),
        };
        let narrowed = parent.narrow(Some(&requested));
        assert_eq!(
            narrowed.allowed_tools,
            Some(vec!["memory_search".to_string()])
        );
        let denied = narrowed.denied_tools.unwrap();
        assert!(denied.contains(&"exec_command".to_string()));
        assert!(denied.contains(&"memory_write".to_string()));
    }

    #[test]
    fn narrow_without_request_is_identity() {
        let parent = DelegatedPermissions {
            allowed_tools: Some(vec!["memory_search".to_string()]),
            denied_tools: None,
        };
        assert_eq!(parent.narrow(None), parent);
    }

    // ── Audit log ───────────────────────────────────────────────────────

    #[test]
    fn audit_log_records_entries() {
        let p = policy();
        p.log_action(
            "run-1",
            "exec_command",
            serde_json::json!({"cmd": "ls"}),
            RiskLevel::High,
            "ask",
            Some("high risk"),
        );
        let log = p.audit_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].tool_name, "exec_command");
        assert_eq!(log[0].decision, "ask");
    }
}
