use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Instance names need a non-empty prefix to be recognizable on a shared server.
    #[error("`name_prefix` cannot be empty")]
    EmptyNamePrefix,
    /// The prefix is passed unquoted to `createdb`, so it must be a plain identifier.
    #[error("`name_prefix` must only contain ASCII letters, digits and underscores, got `{0}`")]
    InvalidNamePrefix(String),
    /// A field holds a value outside of its accepted range.
    #[error("Invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}
