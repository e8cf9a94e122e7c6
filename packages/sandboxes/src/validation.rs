// ABOUTME: Boundary validation of tool parameter maps
// ABOUTME: Checks required/declared types, applies defaults, and builds a typed CodeSubmission

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SandboxError};
use crate::types::Tool;

const LANGUAGE_PARAM: &str = "language";
const CODE_PARAM: &str = "code";
const TESTS_PARAM: &str = "tests";
const DEPENDENCIES_PARAM: &str = "dependencies";

/// Typed view of a validated execution request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeSubmission {
    /// Lower-cased language name
    pub language: String,
    pub code: String,
    /// Test code; when present the profile's test command runs instead of the program
    pub tests: Option<String>,
    /// Dependency manifest contents
    pub dependencies: Option<String>,
    /// All remaining parameters, exposed to the snippet as inputs
    pub inputs: Value,
}

/// Validate a parameter map against the tool's declared schema.
///
/// Missing required parameters and declared-type mismatches are rejected.
/// Optional parameters with a default are filled in. Undeclared parameters
/// pass through untouched.
pub fn validate_parameters(
    tool: &Tool,
    parameters: HashMap<String, Value>,
) -> Result<HashMap<String, Value>> {
    let mut parameters = parameters;
    let mut missing = Vec::new();

    for param in &tool.parameters {
        match parameters.get(&param.name) {
            Some(Value::Null) | None => {
                if let Some(default) = &param.default {
                    parameters.insert(param.name.clone(), default.clone());
                } else if param.required {
                    missing.push(param.name.clone());
                }
            }
            Some(value) => {
                if !param.param_type.matches(value) {
                    return Err(SandboxError::Validation(format!(
                        "parameter '{}' must be of type {:?}",
                        param.name, param.param_type
                    )));
                }
            }
        }
    }

    if !missing.is_empty() {
        return Err(SandboxError::Validation(format!(
            "missing required parameters: {}",
            missing.join(", ")
        )));
    }

    Ok(parameters)
}

impl CodeSubmission {
    /// Build a submission from an already validated parameter map
    pub fn from_parameters(tool: &Tool, parameters: &HashMap<String, Value>) -> Result<Self> {
        let language = match parameters.get(LANGUAGE_PARAM) {
            Some(Value::String(lang)) if !lang.trim().is_empty() => lang.trim().to_lowercase(),
            Some(Value::String(_)) | None | Some(Value::Null) => tool.command.trim().to_lowercase(),
            Some(_) => {
                return Err(SandboxError::Validation(
                    "parameter 'language' must be a string".to_string(),
                ))
            }
        };

        if language.is_empty() {
            return Err(SandboxError::Validation(
                "no language given and tool has no default command".to_string(),
            ));
        }

        let code = optional_string(parameters, CODE_PARAM)?.ok_or_else(|| {
            SandboxError::Validation("missing required parameters: code".to_string())
        })?;

        let tests = optional_string(parameters, TESTS_PARAM)?;
        let dependencies = optional_string(parameters, DEPENDENCIES_PARAM)?;

        let inputs: serde_json::Map<String, Value> = parameters
            .iter()
            .filter(|(name, _)| {
                ![LANGUAGE_PARAM, CODE_PARAM, TESTS_PARAM, DEPENDENCIES_PARAM]
                    .contains(&name.as_str())
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Ok(Self {
            language,
            code,
            tests,
            dependencies,
            inputs: Value::Object(inputs),
        })
    }
}

fn optional_string(parameters: &HashMap<String, Value>, name: &str) -> Result<Option<String>> {
    match parameters.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(SandboxError::Validation(format!(
            "parameter '{}' must be a string",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IsolationTier, ParamType, ResourceLimits, ToolParameter, ToolType};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn tool() -> Tool {
        Tool {
            id: "runner".to_string(),
            name: "Runner".to_string(),
            tool_type: ToolType::Execution,
            command: "JavaScript".to_string(),
            parameters: vec![
                ToolParameter {
                    name: "code".to_string(),
                    param_type: ParamType::String,
                    required: true,
                    default: None,
                },
                ToolParameter {
                    name: "retries".to_string(),
                    param_type: ParamType::Number,
                    required: false,
                    default: Some(json!(3)),
                },
            ],
            resource_limits: ResourceLimits::default(),
            isolation: IsolationTier::InProcess,
        }
    }

    fn params(value: Value) -> HashMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_missing_required_parameter_is_rejected() {
        let err = validate_parameters(&tool(), params(json!({"retries": 1}))).unwrap_err();
        assert!(matches!(err, SandboxError::Validation(msg) if msg.contains("code")));
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let err = validate_parameters(&tool(), params(json!({"code": 5}))).unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
    }

    #[test]
    fn test_defaults_are_applied() {
        let validated = validate_parameters(&tool(), params(json!({"code": "1"}))).unwrap();
        assert_eq!(validated.get("retries"), Some(&json!(3)));
    }

    #[test]
    fn test_submission_falls_back_to_tool_command() {
        let validated =
            validate_parameters(&tool(), params(json!({"code": "1 + 1", "user": "x"}))).unwrap();
        let submission = CodeSubmission::from_parameters(&tool(), &validated).unwrap();

        assert_eq!(submission.language, "javascript");
        assert_eq!(submission.code, "1 + 1");
        assert_eq!(submission.tests, None);
        assert_eq!(submission.inputs, json!({"retries": 3, "user": "x"}));
    }

    #[test]
    fn test_submission_prefers_language_parameter() {
        let validated = params(json!({
            "code": "print(1)",
            "language": "Python",
            "tests": "assert True",
            "dependencies": "requests==2.0"
        }));
        let submission = CodeSubmission::from_parameters(&tool(), &validated).unwrap();

        assert_eq!(submission.language, "python");
        assert_eq!(submission.tests.as_deref(), Some("assert True"));
        assert_eq!(submission.dependencies.as_deref(), Some("requests==2.0"));
        assert_eq!(submission.inputs, json!({}));
    }

    #[test]
    fn test_non_string_tests_rejected() {
        let validated = params(json!({"code": "1", "tests": 5}));
        assert!(CodeSubmission::from_parameters(&tool(), &validated).is_err());
    }
}
