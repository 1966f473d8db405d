use serde::{Deserialize, Serialize};

pub const APP_NAME_MAX_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    InvalidAppName { name: String, reason: &'static str },
    MissingApp { name: String },
    AppNameConflict { name: String },
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAppName { .. } => "invalid_request",
            Self::MissingApp { .. } => "not_found",
            Self::AppNameConflict { .. } => "conflict",
        }
    }
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAppName { name, reason } => {
                write!(f, "invalid app name {name:?}: {reason}")
            }
            Self::MissingApp { name } => write!(f, "app not found: {name}"),
            Self::AppNameConflict { name } => write!(f, "app already exists: {name}"),
        }
    }
}

impl std::error::Error for DomainError {}

/// A named deployable unit.
///
/// `name` is the identity and never changes once the app is stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub name: String,
    #[serde(default)]
    pub framework: String,
    #[serde(default)]
    pub ip: String,
}

impl App {
    pub fn new(name: impl Into<String>, framework: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            framework: framework.into(),
            ip: String::new(),
        }
    }
}

/// Latest archive accepted for an app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    pub deployment_id: String,
    pub app_name: String,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub entries: usize,
    pub received_at: String,
}

pub fn validate_app_name(name: &str) -> Result<(), DomainError> {
    let invalid = |reason| DomainError::InvalidAppName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > APP_NAME_MAX_LEN {
        return Err(invalid("must be at most 63 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid("only ascii letters, digits, '-' and '_' are allowed"));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(invalid("must start with a letter or digit"));
    }
    Ok(())
}
