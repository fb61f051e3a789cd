use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Identifies a function's deployable unit: the source path it was built
/// from and the artifact the build produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDescriptor {
    pub src_path: String,
    pub out_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

impl FunctionDescriptor {
    pub fn new(src_path: impl Into<String>, out_path: impl Into<String>) -> Self {
        Self {
            src_path: src_path.into(),
            out_path: out_path.into(),
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    /// Handler name, falling back to the last `.` separated segment of the
    /// source path (`src/api.main` -> `main`).
    pub fn handler(&self) -> &str {
        match &self.handler {
            Some(handler) => handler,
            None => self
                .src_path
                .rsplit('.')
                .next()
                .unwrap_or(self.src_path.as_str()),
        }
    }

    pub fn id(&self) -> FunctionId {
        FunctionId::from_src_path(&self.src_path)
    }
}

/// SHA-256 of a function's normalized source path, hex encoded. Pools are
/// partitioned by this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(String);

impl FunctionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_src_path(src_path: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_path(src_path).as_bytes());
        Self(hex::encode(hasher.finalize()))
    }
}

impl Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lexical path normalization: collapses repeated separators, drops `.`
/// segments and folds `..` into its parent. The filesystem is never touched.
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let is_absolute = path.starts_with('/');
    let trailing_separator = path.ends_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(last) if *last != ".." => {
                    segments.pop();
                }
                _ if is_absolute => {}
                _ => segments.push(".."),
            },
            segment => segments.push(segment),
        }
    }

    let mut normalized = segments.join("/");
    if is_absolute {
        normalized.insert(0, '/');
    }
    if normalized.is_empty() {
        normalized.push('.');
    }
    if trailing_separator && !normalized.ends_with('/') {
        normalized.push('/');
    }
    normalized
}

/// Context fields the scheduler reads. Anything else the caller sends is
/// kept in `extra` and forwarded untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    pub aws_request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoked_function_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_context: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A context field that cannot be handed to a worker verbatim.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{field} must not contain control characters")]
pub struct InvalidContext {
    pub field: &'static str,
}

impl InvocationContext {
    pub fn new(aws_request_id: impl Into<String>) -> Self {
        Self {
            aws_request_id: aws_request_id.into(),
            invoked_function_arn: None,
            identity: None,
            client_context: None,
            extra: Map::new(),
        }
    }

    /// The request id and function ARN travel to the worker as raw header
    /// values. `identity` and `client_context` are JSON encoded, which escapes
    /// control characters, so they are always safe.
    pub fn validate(&self) -> Result<(), InvalidContext> {
        if has_control_chars(&self.aws_request_id) {
            return Err(InvalidContext {
                field: "awsRequestId",
            });
        }
        if self
            .invoked_function_arn
            .as_deref()
            .is_some_and(has_control_chars)
        {
            return Err(InvalidContext {
                field: "invokedFunctionArn",
            });
        }
        Ok(())
    }
}

fn has_control_chars(value: &str) -> bool {
    value.chars().any(|c| c.is_control() && c != '\t')
}

/// One unit of work, consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub event: Value,
    pub context: InvocationContext,
    /// Epoch milliseconds. Advisory, handed to the worker but never enforced.
    pub deadline: u64,
}

impl Invocation {
    pub fn new(event: Value, context: InvocationContext, deadline: u64) -> Self {
        Self {
            event,
            context,
            deadline,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.context.aws_request_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failure => write!(f, "failure"),
        }
    }
}

/// What a caller gets back once the worker posts its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InvocationResult {
    Success { data: Value },
    Failure { error: Value },
}

impl InvocationResult {
    pub fn new(outcome: Outcome, body: Value) -> Self {
        match outcome {
            Outcome::Success => InvocationResult::Success { data: body },
            Outcome::Failure => InvocationResult::Failure { error: body },
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            InvocationResult::Success { .. } => Outcome::Success,
            InvocationResult::Failure { .. } => Outcome::Failure,
        }
    }

    pub fn body(&self) -> &Value {
        match self {
            InvocationResult::Success { data } => data,
            InvocationResult::Failure { error } => error,
        }
    }
}
