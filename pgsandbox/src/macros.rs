//! Shorthands for building [`crate::error::SandboxError`] values.

/// Builds a [`crate::error::SandboxError`] from a kind, a static description and, optionally,
/// a detail message and a source error.
#[macro_export]
macro_rules! sandbox_error {
    ($kind:expr, $desc:expr $(,)?) => {
        $crate::error::SandboxError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr $(,)?) => {
        $crate::error::SandboxError::from(($kind, $desc, ::std::string::ToString::to_string(&$detail)))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr $(,)?) => {
        $crate::sandbox_error!($kind, $desc, $detail).with_source($source)
    };
}

/// Returns early with a [`crate::error::SandboxError`] built by [`sandbox_error!`].
#[macro_export]
macro_rules! bail {
    ($($arg:tt)+) => {
        return ::core::result::Result::Err($crate::sandbox_error!($($arg)+))
    };
}
