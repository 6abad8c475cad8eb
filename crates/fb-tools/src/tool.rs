use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// ToolCategory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// Always-on tools; unloading requires `force`.
    Core,
    Cicd,
    Database,
    Dependencies,
    Deployment,
    Memory,
    Quality,
    Security,
    Testing,
    Web,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Core => "core",
            ToolCategory::Cicd => "cicd",
            ToolCategory::Database => "database",
            ToolCategory::Dependencies => "dependencies",
            ToolCategory::Deployment => "deployment",
            ToolCategory::Memory => "memory",
            ToolCategory::Quality => "quality",
            ToolCategory::Security => "security",
            ToolCategory::Testing => "testing",
            ToolCategory::Web => "web",
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter schema
// ---------------------------------------------------------------------------

/// Tagged parameter type; `Enum` carries its allowed values explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Enum(Vec<String>),
}

impl ParameterType {
    /// Check a JSON value against this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Integer => value.is_i64() || value.is_u64(),
            ParameterType::Number => value.is_number(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Array => value.is_array(),
            ParameterType::Object => value.is_object(),
            ParameterType::Enum(allowed) => value
                .as_str()
                .is_some_and(|s| allowed.iter().any(|a| a == s)),
        }
    }

    /// JSON-schema fragment for this type.
    fn to_schema(&self) -> Value {
        match self {
            ParameterType::String => json!({"type": "string"}),
            ParameterType::Integer => json!({"type": "integer"}),
            ParameterType::Number => json!({"type": "number"}),
            ParameterType::Boolean => json!({"type": "boolean"}),
            ParameterType::Array => json!({"type": "array"}),
            ParameterType::Object => json!({"type": "object"}),
            ParameterType::Enum(values) => json!({"type": "string", "enum": values}),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub description: String,
    pub param_type: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

impl ToolParameter {
    pub fn required(
        name: impl Into<String>,
        description: impl Into<String>,
        param_type: ParameterType,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            param_type,
            required: true,
            default: None,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        description: impl Into<String>,
        param_type: ParameterType,
        default: Option<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            param_type,
            required: false,
            default,
        }
    }
}

// ---------------------------------------------------------------------------
// ToolDefinition
// ---------------------------------------------------------------------------

/// Metadata plus the typed parameter schema for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

impl ToolDefinition {
    /// JSON schema for the parameter object.
    pub fn to_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut schema = param.param_type.to_schema();
            if let Some(obj) = schema.as_object_mut() {
                obj.insert("description".into(), param.description.clone().into());
                if let Some(default) = &param.default {
                    obj.insert("default".into(), default.clone());
                }
            }
            properties.insert(param.name.clone(), schema);
            if param.required {
                required.push(param.name.clone());
            }
        }
        json!({
            "name": self.name,
            "description": self.description,
            "category": self.category.as_str(),
            "input_schema": {
                "type": "object",
                "properties": properties,
                "required": required,
            },
        })
    }

    /// Validate a parameter object against the schema, filling defaults.
    /// Returns the effective parameters or a human-readable error.
    pub fn validate_params(&self, params: &Value) -> Result<Value, String> {
        let mut effective = match params {
            Value::Null => serde_json::Map::new(),
            Value::Object(map) => map.clone(),
            other => return Err(format!("parameters must be an object, got {other}")),
        };

        for key in effective.keys() {
            if !self.parameters.iter().any(|p| &p.name == key) {
                return Err(format!("unknown parameter: {key}"));
            }
        }

        for param in &self.parameters {
            match effective.get(&param.name) {
                Some(value) => {
                    if !param.param_type.accepts(value) {
                        return Err(format!(
                            "parameter {} does not match its declared type",
                            param.name
                        ));
                    }
                }
                None if param.required => {
                    return Err(format!("missing required parameter: {}", param.name));
                }
                None => {
                    if let Some(default) = &param.default {
                        effective.insert(param.name.clone(), default.clone());
                    }
                }
            }
        }

        Ok(Value::Object(effective))
    }
}

// ---------------------------------------------------------------------------
// ToolResult
// ---------------------------------------------------------------------------

/// Outcome of one tool execution. `data` is an opaque JSON-shaped payload
/// carried through the core as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub execution_time_ms: f64,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            execution_time_ms: 0.0,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            execution_time_ms: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// A named, parameterized operation invoked by agents through the registry.
///
/// `execute` receives parameters already validated against the definition;
/// it may block or suspend for arbitrary time and must be safe to invoke
/// concurrently.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    async fn execute(&self, params: Value) -> anyhow::Result<Value>;

    fn name(&self) -> &str {
        &self.definition().name
    }

    fn category(&self) -> ToolCategory {
        self.definition().category
    }
}

/// Execute a tool with validation, timing, timeout, and failure capture.
///
/// Never panics and never propagates errors: every failure becomes a
/// `ToolResult { success: false }` with the error text, a timeout becomes
/// `error = "timeout"`.
pub async fn safe_execute(
    tool: &dyn Tool,
    params: Value,
    timeout: Option<Duration>,
) -> ToolResult {
    let effective = match tool.definition().validate_params(&params) {
        Ok(effective) => effective,
        Err(message) => return ToolResult::err(message),
    };

    let start = Instant::now();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, tool.execute(effective)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("timeout")),
        },
        None => tool.execute(effective).await,
    };
    let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;

    let mut result = match outcome {
        Ok(data) => ToolResult::ok(data),
        Err(e) => ToolResult::err(e.to_string()),
    };
    result.execution_time_ms = elapsed_ms;
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool {
        definition: ToolDefinition,
    }

    impl EchoTool {
        fn new() -> Self {
            Self {
                definition: ToolDefinition {
                    name: "echo".into(),
                    description: "Echo back the message".into(),
                    category: ToolCategory::Core,
                    parameters: vec![
                        ToolParameter::required("message", "text to echo", ParameterType::String),
                        ToolParameter::optional(
                            "repeat",
                            "repetitions",
                            ParameterType::Integer,
                            Some(json!(1)),
                        ),
                        ToolParameter::optional(
                            "mode",
                            "echo mode",
                            ParameterType::Enum(vec!["plain".into(), "loud".into()]),
                            None,
                        ),
                    ],
                },
            }
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn definition(&self) -> &ToolDefinition {
            &self.definition
        }

        async fn execute(&self, params: Value) -> anyhow::Result<Value> {
            let message = params["message"].as_str().unwrap_or_default();
            let repeat = params["repeat"].as_i64().unwrap_or(1);
            if message == "boom" {
                anyhow::bail!("echo exploded");
            }
            Ok(json!({ "echoed": vec![message; repeat as usize].join(" ") }))
        }
    }

    struct SlowTool {
        definition: ToolDefinition,
    }

    #[async_trait]
    impl Tool for SlowTool {
        fn definition(&self) -> &ToolDefinition {
            &self.definition
        }

        async fn execute(&self, _params: Value) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!(null))
        }
    }

    #[tokio::test]
    async fn safe_execute_happy_path_records_timing() {
        let tool = EchoTool::new();
        let result = safe_execute(&tool, json!({"message": "hi", "repeat": 2}), None).await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()["echoed"], "hi hi");
        assert!(result.execution_time_ms >= 0.0);
    }

    #[tokio::test]
    async fn safe_execute_fills_defaults() {
        let tool = EchoTool::new();
        let result = safe_execute(&tool, json!({"message": "once"}), None).await;
        assert_eq!(result.data.unwrap()["echoed"], "once");
    }

    #[tokio::test]
    async fn safe_execute_rejects_missing_required() {
        let tool = EchoTool::new();
        let result = safe_execute(&tool, json!({}), None).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("missing required parameter"));
    }

    #[tokio::test]
    async fn safe_execute_rejects_type_mismatch_and_unknown() {
        let tool = EchoTool::new();
        let result = safe_execute(&tool, json!({"message": 42}), None).await;
        assert!(!result.success);

        let result = safe_execute(&tool, json!({"message": "hi", "bogus": 1}), None).await;
        assert_eq!(result.error.unwrap(), "unknown parameter: bogus");
    }

    #[tokio::test]
    async fn enum_parameters_check_membership() {
        let tool = EchoTool::new();
        let ok = safe_execute(&tool, json!({"message": "hi", "mode": "loud"}), None).await;
        assert!(ok.success);
        let bad = safe_execute(&tool, json!({"message": "hi", "mode": "whisper"}), None).await;
        assert!(!bad.success);
    }

    #[tokio::test]
    async fn safe_execute_captures_tool_errors() {
        let tool = EchoTool::new();
        let result = safe_execute(&tool, json!({"message": "boom"}), None).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap(), "echo exploded");
    }

    #[tokio::test(start_paused = true)]
    async fn safe_execute_times_out() {
        let tool = SlowTool {
            definition: ToolDefinition {
                name: "slow".into(),
                description: "sleeps forever".into(),
                category: ToolCategory::Testing,
                parameters: vec![],
            },
        };
        let result = safe_execute(&tool, json!({}), Some(Duration::from_millis(50))).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap(), "timeout");
    }

    #[test]
    fn schema_exposes_properties_and_required() {
        let tool = EchoTool::new();
        let schema = tool.definition().to_schema();
        assert_eq!(schema["name"], "echo");
        assert_eq!(schema["input_schema"]["properties"]["message"]["type"], "string");
        assert_eq!(schema["input_schema"]["required"][0], "message");
        assert_eq!(
            schema["input_schema"]["properties"]["mode"]["enum"][1],
            "loud"
        );
    }

    #[test]
    fn parameter_type_serde_is_tagged() {
        let t = ParameterType::Enum(vec!["a".into(), "b".into()]);
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["type"], "enum");
        assert_eq!(json["values"][0], "a");
        let back: ParameterType = serde_json::from_value(json).unwrap();
        assert_eq!(back, t);
    }
}
