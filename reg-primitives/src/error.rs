//! Shared error definitions for registry primitive types.

use thiserror::Error;

/// Result alias used throughout the primitives crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while manipulating registry identity types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The supplied string was not a well-formed `scheme://host[:port][/path][?query]` URL.
    #[error("malformed registry url `{input}`: {reason}")]
    MalformedUrl {
        /// The offending input string.
        input: String,
        /// Human-readable reason for rejection.
        reason: &'static str,
    },

    /// A query parameter value could not be parsed as the requested type.
    #[error("parameter `{key}` has invalid value `{value}`")]
    InvalidParameter {
        /// Name of the offending parameter.
        key: String,
        /// Raw value that failed to parse.
        value: String,
    },
}
