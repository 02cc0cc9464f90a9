/// Crate-wide error types for kbforge
///
/// Provides actionable error messages with enough context for callers (HTTP
/// handlers, worker loops) to decide whether to retry, surface to a user, or
/// log and move on.

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        CoreError::Transport(e.to_string())
    }
}

impl CoreError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        CoreError::Validation {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Truncate an error message to the 1000-character limit the job
/// `last_error` column enforces.
pub fn truncate_error(message: &str) -> String {
    const MAX: usize = 1000;
    if message.chars().count() <= MAX {
        message.to_string()
    } else {
        let mut truncated: String = message.chars().take(MAX).collect();
        truncated.push_str("... (truncated)");
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_error_leaves_short_messages_untouched() {
        assert_eq!(truncate_error("boom"), "boom");
    }

    #[test]
    fn truncate_error_caps_long_messages() {
        let long = "x".repeat(5000);
        let truncated = truncate_error(&long);
        assert!(truncated.chars().count() <= 1000 + "... (truncated)".chars().count());
        assert!(truncated.ends_with("... (truncated)"));
    }
}
