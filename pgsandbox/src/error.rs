//! Error types and result definitions for sandbox operations.
//!
//! [`SandboxError`] carries a classification, a static description, optional dynamic detail
//! such as a command line and its output, and the call site it was raised from. Teardown
//! paths aggregate every failure they encounter into a single error.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Convenient result type for sandbox operations using [`SandboxError`] as the error type.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Detailed payload stored for single [`SandboxError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type for sandbox operations.
#[derive(Debug, Clone)]
pub struct SandboxError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    /// Single error payload holding rich metadata.
    Single(ErrorPayload),
    /// Multiple aggregated errors, collected by teardown paths that keep going after a
    /// failure.
    Many {
        errors: Vec<SandboxError>,
        location: &'static Location<'static>,
    },
}

/// Categories of errors raised by the sandbox.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // External processes
    ExecutableNotFound,
    CommandFailed,

    // Cluster lifecycle
    LifecycleViolation,
    ReadinessTimeout,
    ServerExited,

    // Instance ownership
    ForeignInstance,
    TemplateMismatch,

    // Connections
    ConnectionFailed,

    // Infrastructure
    IoError,
    ConfigError,
    BackgroundTaskFailed,
    HookFailed,

    Unknown,
}

impl SandboxError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For multiple errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// if the error list is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error, flattened.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the detail of this error, or of the first aggregated error that has one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the static description of this error.
    ///
    /// Aggregated errors return the description of their first error.
    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.description.as_ref(),
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.description())
                .unwrap_or("no inner errors"),
        }
    }

    /// Returns the captured backtrace for this error.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating [`error::Error`] to this error.
    ///
    /// Has no effect on aggregated errors, which forward their first error as source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        SandboxError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for SandboxError {
    fn eq(&self, other: &SandboxError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (
                ErrorRepr::Many {
                    errors: errors_a, ..
                },
                ErrorRepr::Many {
                    errors: errors_b, ..
                },
            ) => errors_a == errors_b,
            _ => false,
        }
    }
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                write_indented("Detail", payload.detail.as_deref(), f)?;

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_indented("Backtrace", Some(&backtrace), f)?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for SandboxError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

/// Writes a labelled block with every line indented under the label.
fn write_indented(label: &str, block: Option<&str>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let Some(block) = block else {
        return Ok(());
    };

    if block.trim().is_empty() {
        return write!(f, "\n  {label}: <empty>");
    }

    write!(f, "\n  {label}:")?;
    for line in block.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

/// Creates a [`SandboxError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for SandboxError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> SandboxError {
        SandboxError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates a [`SandboxError`] from an error kind, static description and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for SandboxError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> SandboxError {
        SandboxError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors.
///
/// A vector holding exactly one error returns that error unwrapped.
impl<E> From<Vec<E>> for SandboxError
where
    E: Into<SandboxError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> SandboxError {
        let location = Location::caller();

        let mut errors: Vec<SandboxError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        SandboxError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for SandboxError {
    #[track_caller]
    fn from(err: std::io::Error) -> SandboxError {
        let detail = err.to_string();
        SandboxError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<pgsandbox_config::LoadConfigError> for SandboxError {
    #[track_caller]
    fn from(err: pgsandbox_config::LoadConfigError) -> SandboxError {
        let detail = err.to_string();
        SandboxError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Sandbox configuration could not be loaded"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<pgsandbox_config::ValidationError> for SandboxError {
    #[track_caller]
    fn from(err: pgsandbox_config::ValidationError) -> SandboxError {
        let detail = err.to_string();
        SandboxError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Sandbox configuration is invalid"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps a failed join of a background task.
impl From<tokio::task::JoinError> for SandboxError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> SandboxError {
        let description = if err.is_panic() {
            "Background task panicked"
        } else {
            "Background task was cancelled"
        };

        let detail = err.to_string();
        SandboxError::from_components(
            ErrorKind::BackgroundTaskFailed,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;
    use crate::sandbox_error;

    #[test]
    fn single_error_exposes_kind_and_detail() {
        let err = sandbox_error!(
            ErrorKind::CommandFailed,
            "Command exited unsuccessfully",
            "command failed: createdb test_db1"
        );

        assert_eq!(err.kind(), ErrorKind::CommandFailed);
        assert_eq!(err.detail(), Some("command failed: createdb test_db1"));
        assert_eq!(err.description(), "Command exited unsuccessfully");
        assert!(err.to_string().contains("[CommandFailed]"));
        assert!(err.to_string().contains("createdb test_db1"));
    }

    #[test]
    fn aggregation_flattens_kinds() {
        let err = SandboxError::from(vec![
            sandbox_error!(ErrorKind::CommandFailed, "first"),
            sandbox_error!(ErrorKind::IoError, "second"),
        ]);

        assert_eq!(err.kind(), ErrorKind::CommandFailed);
        assert_eq!(
            err.kinds(),
            vec![ErrorKind::CommandFailed, ErrorKind::IoError]
        );
        assert!(err.to_string().starts_with("[Many] 2 errors aggregated"));
        assert!(err.source().is_some());
    }

    #[test]
    fn aggregating_one_error_unwraps_it() {
        let err = SandboxError::from(vec![sandbox_error!(
            ErrorKind::ReadinessTimeout,
            "Server did not become ready"
        )]);

        assert_eq!(err.kinds(), vec![ErrorKind::ReadinessTimeout]);
        assert!(err.backtrace().is_some());
    }

    #[test]
    fn io_errors_keep_their_source() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = SandboxError::from(io);

        assert_eq!(err.kind(), ErrorKind::IoError);
        assert_eq!(err.source().map(|s| s.to_string()), Some("denied".into()));
    }
}
