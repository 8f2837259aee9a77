//! Typed verifier declarations.
//!
//! Criteria are stored as a kind string plus a JSON parameter object.
//! [`Verifier::from_criterion`] turns that pair into the closed [`Verifier`]
//! sum type the engine dispatches on. Adding a kind means one new variant,
//! one parser arm and one engine arm.

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::errors::VerifierError;

/// A runnable shell check.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandCheck {
    pub command: String,
    pub expected_exit_code: i32,
    /// Regex (or literal, when the regex does not compile) the combined
    /// stdout+stderr must contain.
    pub expected_output: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verifier {
    Command(CommandCheck),
    FileExists {
        path: String,
    },
    Grep {
        file: String,
        pattern: String,
        should_match: bool,
    },
    TestPass {
        test_command: String,
        test_pattern: Option<String>,
    },
    Manual {
        instructions: Option<String>,
    },
}

#[derive(Deserialize)]
struct CommandParams {
    command: Option<String>,
    expected_exit_code: Option<i32>,
    expected_output: Option<String>,
}

#[derive(Deserialize)]
struct FileExistsParams {
    path: Option<String>,
}

#[derive(Deserialize)]
struct GrepParams {
    file: Option<String>,
    pattern: Option<String>,
    should_match: Option<bool>,
}

#[derive(Deserialize)]
struct TestPassParams {
    test_command: Option<String>,
    test_pattern: Option<String>,
}

#[derive(Deserialize)]
struct ManualParams {
    instructions: Option<String>,
}

/// All verifier kind names, in the order the CLI lists them.
pub const VERIFIER_KINDS: [&str; 5] = ["command", "file_exists", "grep", "test_pass", "manual"];

impl Verifier {
    /// Parse a stored criterion declaration.
    pub fn from_criterion(kind: &str, params: &serde_json::Value) -> Result<Self, VerifierError> {
        match kind {
            "command" => {
                let p: CommandParams = parse_params("command", params)?;
                Ok(Self::Command(CommandCheck {
                    command: required("command", "command", p.command)?,
                    expected_exit_code: p.expected_exit_code.unwrap_or(0),
                    expected_output: non_empty(p.expected_output),
                }))
            }
            "file_exists" => {
                let p: FileExistsParams = parse_params("file_exists", params)?;
                Ok(Self::FileExists {
                    path: required("file_exists", "path", p.path)?,
                })
            }
            "grep" => {
                let p: GrepParams = parse_params("grep", params)?;
                Ok(Self::Grep {
                    file: required("grep", "file", p.file)?,
                    pattern: required("grep", "pattern", p.pattern)?,
                    should_match: p.should_match.unwrap_or(true),
                })
            }
            "test_pass" => {
                let p: TestPassParams = parse_params("test_pass", params)?;
                Ok(Self::TestPass {
                    test_command: required("test_pass", "test_command", p.test_command)?,
                    test_pattern: non_empty(p.test_pattern),
                })
            }
            "manual" => {
                let p: ManualParams = parse_params("manual", params)?;
                Ok(Self::Manual {
                    instructions: non_empty(p.instructions),
                })
            }
            other => Err(VerifierError::UnknownKind {
                kind: other.to_string(),
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(_) => "command",
            Self::FileExists { .. } => "file_exists",
            Self::Grep { .. } => "grep",
            Self::TestPass { .. } => "test_pass",
            Self::Manual { .. } => "manual",
        }
    }

    /// The command check a `test_pass` criterion stands for. Exit code 0 is
    /// always required.
    pub fn as_command(&self) -> Option<CommandCheck> {
        match self {
            Self::Command(check) => Some(check.clone()),
            Self::TestPass {
                test_command,
                test_pattern,
            } => Some(CommandCheck {
                command: test_command.clone(),
                expected_exit_code: 0,
                expected_output: test_pattern.clone(),
            }),
            _ => None,
        }
    }
}

fn parse_params<T: DeserializeOwned>(
    kind: &'static str,
    params: &serde_json::Value,
) -> Result<T, VerifierError> {
    // Rows written before params existed carry `null`.
    let value = if params.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        params.clone()
    };
    serde_json::from_value(value).map_err(|e| VerifierError::InvalidParams {
        kind,
        message: e.to_string(),
    })
}

fn required(
    kind: &'static str,
    field: &'static str,
    value: Option<String>,
) -> Result<String, VerifierError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(VerifierError::MissingField { kind, field }),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
