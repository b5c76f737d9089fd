/// Errors produced by the `ferry-core` crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A task identifier string could not be parsed.
    #[error("invalid task id '{value}': {reason}")]
    InvalidTaskId { value: String, reason: String },

    /// A task kind string is not one of the known kinds.
    #[error("unknown task kind '{0}'")]
    UnknownTaskKind(String),

    /// Task options failed validation.
    #[error("invalid option '{field}': {reason}")]
    InvalidOption { field: String, reason: String },
}
