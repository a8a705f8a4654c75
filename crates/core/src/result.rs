//! Result type definition and extension traits.
//!
//! Provides combinators for the write paths, where some errors are expected
//! outcomes rather than failures.

use crate::error::Error;
use crate::resource::ResourceId;

/// The standard Result type for steward operations.
///
/// # Examples
///
/// ```ignore
/// fn load() -> Result<EngineSettings> {
///     let settings = EngineSettings::from_toml_str(raw)?;
///     Ok(settings)
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for cluster call results.
pub trait ResultExt<T> {
    /// Treat `NotFound` as an absent value. Other errors pass through.
    ///
    /// # Errors
    ///
    /// Returns every error except `NotFound`.
    fn ignore_not_found(self) -> Result<Option<T>>;

    /// Convert to an Option, logging the error against `id` if present.
    fn ok_logged(self, id: &ResourceId, context: &str) -> Option<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn ignore_not_found(self) -> Result<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn ok_logged(self, id: &ResourceId, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(%id, error = %e, "{context}");
                None
            }
        }
    }
}
