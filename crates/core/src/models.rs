use std::{
    fmt::{self, Display},
    str::FromStr,
    sync::OnceLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Request body must be a JSON object")]
    NotAnObject,
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("Invalid request: {0}")]
    Malformed(String),
}

fn name_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").unwrap())
}

fn is_valid_name(s: &str) -> bool { s != "." && s != ".." && name_regex().is_match(s) }

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid repository name `{0}`, expected `owner/name`")]
pub struct RepositoryNameError(String);

/// A GitHub repository in `owner/name` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepositoryName {
    pub owner: String,
    pub name: String,
}

impl FromStr for RepositoryName {
    type Err = RepositoryNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, name)) if is_valid_name(owner) && is_valid_name(name) => {
                Ok(Self { owner: owner.to_string(), name: name.to_string() })
            }
            _ => Err(RepositoryNameError(s.to_string())),
        }
    }
}

impl TryFrom<String> for RepositoryName {
    type Error = RepositoryNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> { value.parse() }
}

impl From<RepositoryName> for String {
    fn from(value: RepositoryName) -> Self { value.to_string() }
}

impl Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// A request to dispatch `workflow` on `repository` at `git_ref` and wait for the run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeployRequest {
    pub platform: String,
    pub channel: String,
    pub thread_ts: String,
    pub user: String,
    pub repository: RepositoryName,
    pub workflow: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub completion_message: String,
    pub artifacts_to_read: Vec<String>,
}

impl DeployRequest {
    pub const REQUIRED_FIELDS: &'static [&'static str] = &[
        "platform",
        "channel",
        "thread_ts",
        "user",
        "repository",
        "workflow",
        "ref",
        "completion_message",
        "artifacts_to_read",
    ];

    fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_name(&self.workflow) {
            return Err(ValidationError::InvalidField {
                field: "workflow",
                reason: format!("`{}` is not a workflow file name or ID", self.workflow),
            });
        }
        if self.git_ref.is_empty()
            || self.git_ref.contains("..")
            || self.git_ref.chars().any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(ValidationError::InvalidField {
                field: "ref",
                reason: format!("`{}` is not a valid git ref", self.git_ref),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum HttpVerb {
    Get,
    Post,
    Put,
    Delete,
}

impl FromStr for HttpVerb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            _ => Err(format!("Invalid HTTP verb: {s}")),
        }
    }
}

impl TryFrom<String> for HttpVerb {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> { value.parse() }
}

impl From<HttpVerb> for String {
    fn from(value: HttpVerb) -> Self { value.to_string() }
}

impl Display for HttpVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        })
    }
}

/// Deploy request accepted by the repeater, which also names the call to repeat.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RepeatRequest {
    #[serde(flatten)]
    pub deploy: DeployRequest,
    pub verb: HttpVerb,
    pub endpoint: String,
    pub payload: Value,
}

/// Typed construction of a request from an untrusted JSON body.
pub trait FromPayload: Sized {
    fn from_payload(payload: Value, config: &Config) -> Result<Self, ValidationError>;
}

/// Checks `required` in order, then deserializes the whole object.
fn extract<T: DeserializeOwned>(
    payload: Value,
    required: &[&'static str],
) -> Result<T, ValidationError> {
    let Value::Object(map) = &payload else {
        return Err(ValidationError::NotAnObject);
    };
    if let Some(field) = required.iter().find(|field| !map.contains_key(**field)) {
        return Err(ValidationError::MissingField(*field));
    }
    serde_json::from_value(payload).map_err(|e| ValidationError::Malformed(e.to_string()))
}

impl FromPayload for DeployRequest {
    fn from_payload(payload: Value, _config: &Config) -> Result<Self, ValidationError> {
        let request: Self = extract(payload, Self::REQUIRED_FIELDS)?;
        request.validate()?;
        Ok(request)
    }
}

impl FromPayload for RepeatRequest {
    fn from_payload(payload: Value, config: &Config) -> Result<Self, ValidationError> {
        let required = DeployRequest::REQUIRED_FIELDS
            .iter()
            .copied()
            .chain(["verb", "endpoint", "payload"])
            .collect::<Vec<_>>();
        let request: Self = extract(payload, &required)?;
        request.deploy.validate()?;
        if !config.repeater.allowed_endpoints.iter().any(|e| *e == request.endpoint) {
            return Err(ValidationError::InvalidField {
                field: "endpoint",
                reason: format!("Invalid endpoint: {}", request.endpoint),
            });
        }
        Ok(request)
    }
}
