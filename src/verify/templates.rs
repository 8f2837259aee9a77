//! Built-in criteria templates for common project stacks.
//!
//! Each template lists its criteria in execution order: build before test.

use autoloop_common::{NewCriterion, Priority};
use serde_json::json;

pub struct CriteriaTemplate {
    pub name: &'static str,
    pub description: &'static str,
    build: fn() -> Vec<NewCriterion>,
}

impl CriteriaTemplate {
    pub fn criteria(&self) -> Vec<NewCriterion> {
        (self.build)()
    }
}

pub const TEMPLATES: &[CriteriaTemplate] = &[
    CriteriaTemplate {
        name: "rust",
        description: "cargo build, cargo test, clippy clean",
        build: rust_criteria,
    },
    CriteriaTemplate {
        name: "node",
        description: "npm install, build, test",
        build: node_criteria,
    },
    CriteriaTemplate {
        name: "python",
        description: "pytest passes, no syntax errors",
        build: python_criteria,
    },
];

pub fn find_template(name: &str) -> Option<&'static CriteriaTemplate> {
    TEMPLATES.iter().find(|t| t.name.eq_ignore_ascii_case(name))
}

fn rust_criteria() -> Vec<NewCriterion> {
    vec![
        NewCriterion::new("Cargo manifest present", "file_exists", json!({"path": "Cargo.toml"}))
            .with_priority(Priority::High),
        NewCriterion::new("Project builds", "command", json!({"command": "cargo build"}))
            .with_priority(Priority::Critical),
        NewCriterion::new(
            "Tests pass",
            "test_pass",
            json!({"test_command": "cargo test", "test_pattern": r"test result: ok"}),
        )
        .with_priority(Priority::Critical),
        NewCriterion::new(
            "No clippy warnings",
            "command",
            json!({"command": "cargo clippy -- -D warnings"}),
        ),
    ]
}

fn node_criteria() -> Vec<NewCriterion> {
    vec![
        NewCriterion::new("package.json present", "file_exists", json!({"path": "package.json"}))
            .with_priority(Priority::High),
        NewCriterion::new("Dependencies install", "command", json!({"command": "npm install"})),
        NewCriterion::new(
            "Project builds",
            "command",
            json!({"command": "npm run build --if-present"}),
        )
        .with_priority(Priority::Critical),
        NewCriterion::new("Tests pass", "test_pass", json!({"test_command": "npm test"}))
            .with_priority(Priority::Critical),
    ]
}

fn python_criteria() -> Vec<NewCriterion> {
    vec![
        NewCriterion::new(
            "Sources compile",
            "command",
            json!({"command": "python -m compileall -q ."}),
        )
        .with_priority(Priority::High),
        NewCriterion::new(
            "Tests pass",
            "test_pass",
            json!({"test_command": "python -m pytest -q", "test_pattern": r"\d+ passed"}),
        )
        .with_priority(Priority::Critical),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::Verifier;

    #[test]
    fn test_find_template_case_insensitive() {
        assert_eq!(find_template("Rust").map(|t| t.name), Some("rust"));
        assert!(find_template("cobol").is_none());
    }

    #[test]
    fn test_every_template_criterion_parses() {
        for template in TEMPLATES {
            let criteria = template.criteria();
            assert!(!criteria.is_empty(), "{} is empty", template.name);
            for c in criteria {
                Verifier::from_criterion(&c.verifier, &c.params)
                    .unwrap_or_else(|e| panic!("{} / {}: {}", template.name, c.description, e));
            }
        }
    }

    #[test]
    fn test_rust_builds_before_testing() {
        let criteria = find_template("rust").unwrap().criteria();
        let build = criteria.iter().position(|c| c.description == "Project builds").unwrap();
        let test = criteria.iter().position(|c| c.description == "Tests pass").unwrap();
        assert!(build < test);
    }
}
