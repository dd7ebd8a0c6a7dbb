//! Policy-driven classification of operations and content before execution.
//!
//! Pure: no I/O, a function of its inputs and the configured policy.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub is_safe: bool,
    pub risk: RiskLevel,
    pub violations: Vec<String>,
    pub suggestions: Vec<String>,
}

/// An intended action to be classified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: String,
    pub command: Option<String>,
    pub requires_network: bool,
    pub max_memory_mb: Option<u64>,
    pub max_execution_time: Option<u64>,
}

/// Tagged content (`code`, `data`, …) to be scanned for dangerous
/// constructs.
#[derive(Debug, Clone)]
pub struct Content {
    pub tag: String,
    pub body: String,
}

/// Externalized ruleset. Not hardcoded regexes baked into the validator —
/// the exact signal set an implementation recognizes is configuration,
/// with `default()` encoding the signals called for in the original
/// component design.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    /// Operation `type` values treated as destructive by construction.
    pub destructive_operation_types: Vec<String>,
    /// Substrings in a `system_command`/shell operation's command that mark
    /// it as a recursive remove of a root-level path.
    pub recursive_root_remove_patterns: Vec<String>,
    /// Substrings marking unsafe shell redirection (`> /dev/sda`, pipe to
    /// a shell, etc).
    pub unsafe_redirection_patterns: Vec<String>,
    pub allow_network: bool,
    pub max_memory_mb: u64,
    pub max_execution_time: u64,
    /// Substrings in content that indicate arbitrary code execution or
    /// shell invocation from code.
    pub dangerous_content_patterns: Vec<String>,
    /// `is_safe` is false whenever any violation reaches at least this
    /// risk level.
    pub unsafe_at_or_above: RiskLevel,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            destructive_operation_types: vec!["system_command".to_string(), "raw_shell".to_string()],
            recursive_root_remove_patterns: vec![
                "rm -rf /".to_string(),
                "rm -fr /".to_string(),
                "rm -rf /*".to_string(),
            ],
            unsafe_redirection_patterns: vec![
                "> /dev/sd".to_string(),
                "| sh".to_string(),
                "| bash".to_string(),
                "2>&1 | sh".to_string(),
            ],
            allow_network: true,
            max_memory_mb: 4096,
            max_execution_time: 3600,
            dangerous_content_patterns: vec![
                "eval(".to_string(),
                "exec(".to_string(),
                "os.system(".to_string(),
                "subprocess.".to_string(),
                "__import__(".to_string(),
            ],
            unsafe_at_or_above: RiskLevel::Medium,
        }
    }
}

pub struct SafetyValidator {
    policy: SafetyPolicy,
}

impl SafetyValidator {
    pub fn new(policy: SafetyPolicy) -> Self {
        Self { policy }
    }

    pub fn validate_operation(&self, op: &Operation) -> ValidationOutcome {
        let mut violations = Vec::new();
        let mut suggestions = Vec::new();
        let mut risk = RiskLevel::Low;

        if self
            .policy
            .destructive_operation_types
            .iter()
            .any(|t| t == &op.kind)
        {
            if let Some(command) = &op.command {
                if self
                    .policy
                    .recursive_root_remove_patterns
                    .iter()
                    .any(|p| command.contains(p.as_str()))
                {
                    violations.push(format!(
                        "operation '{}' issues a recursive remove of a root-level path: {command}",
                        op.kind
                    ));
                    suggestions.push("scope the remove to a path under the workspace".to_string());
                    risk = risk.max(RiskLevel::Critical);
                } else if self
                    .policy
                    .unsafe_redirection_patterns
                    .iter()
                    .any(|p| command.contains(p.as_str()))
                {
                    violations.push(format!(
                        "operation '{}' uses an unsafe shell redirection: {command}",
                        op.kind
                    ));
                    risk = risk.max(RiskLevel::High);
                }
            }
        }

        if op.requires_network && !self.policy.allow_network {
            violations.push("operation requires network access, which policy forbids".to_string());
            suggestions.push("set requires_network = false or relax the network policy".to_string());
            risk = risk.max(RiskLevel::Medium);
        }

        if let Some(mem) = op.max_memory_mb {
            if mem > self.policy.max_memory_mb {
                violations.push(format!(
                    "requested max_memory_mb {mem} exceeds policy limit {}",
                    self.policy.max_memory_mb
                ));
                risk = risk.max(RiskLevel::Medium);
            }
        }
        if let Some(secs) = op.max_execution_time {
            if secs > self.policy.max_execution_time {
                violations.push(format!(
                    "requested max_execution_time {secs} exceeds policy limit {}",
                    self.policy.max_execution_time
                ));
                risk = risk.max(RiskLevel::Medium);
            }
        }

        self.finish(risk, violations, suggestions)
    }

    pub fn validate_content(&self, content: &Content) -> ValidationOutcome {
        let mut violations = Vec::new();
        let mut suggestions = Vec::new();
        let mut risk = RiskLevel::Low;

        for pattern in &self.policy.dangerous_content_patterns {
            if content.body.contains(pattern.as_str()) {
                violations.push(format!(
                    "{} content contains dangerous construct: {pattern}",
                    content.tag
                ));
                suggestions.push(format!("remove or sandbox the use of `{pattern}`"));
                risk = risk.max(RiskLevel::High);
            }
        }

        self.finish(risk, violations, suggestions)
    }

    fn finish(
        &self,
        risk: RiskLevel,
        violations: Vec<String>,
        suggestions: Vec<String>,
    ) -> ValidationOutcome {
        let is_safe = violations.is_empty() || risk < self.policy.unsafe_at_or_above;
        ValidationOutcome {
            is_safe,
            risk,
            violations,
            suggestions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursive_remove_is_unsafe_and_high_risk() {
        let validator = SafetyValidator::new(SafetyPolicy::default());
        let op = Operation {
            kind: "system_command".to_string(),
            command: Some("rm -rf /important/data".to_string()),
            requires_network: true,
            max_memory_mb: None,
            max_execution_time: None,
        };
        let outcome = validator.validate_operation(&op);
        assert!(!outcome.is_safe);
        assert!(outcome.risk >= RiskLevel::High);
        assert!(!outcome.violations.is_empty());
    }

    #[test]
    fn benign_operation_is_safe() {
        let validator = SafetyValidator::new(SafetyPolicy::default());
        let op = Operation {
            kind: "read_file".to_string(),
            command: None,
            requires_network: false,
            max_memory_mb: Some(512),
            max_execution_time: Some(30),
        };
        let outcome = validator.validate_operation(&op);
        assert!(outcome.is_safe);
        assert_eq!(outcome.risk, RiskLevel::Low);
    }

    #[test]
    fn network_violation_when_policy_forbids() {
        let mut policy = SafetyPolicy::default();
        policy.allow_network = false;
        let validator = SafetyValidator::new(policy);
        let op = Operation {
            kind: "fetch".to_string(),
            command: None,
            requires_network: true,
            max_memory_mb: None,
            max_execution_time: None,
        };
        let outcome = validator.validate_operation(&op);
        assert!(!outcome.is_safe);
    }

    #[test]
    fn eval_in_code_is_flagged() {
        let validator = SafetyValidator::new(SafetyPolicy::default());
        let content = Content {
            tag: "code".to_string(),
            body: "result = eval(user_input)".to_string(),
        };
        let outcome = validator.validate_content(&content);
        assert!(!outcome.is_safe);
        assert!(outcome.risk >= RiskLevel::High);
    }
}
