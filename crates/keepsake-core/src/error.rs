//! Error types for handler registration.
//!
//! Registration errors are programming mistakes (bad names, duplicate keys)
//! and are returned to the caller. Runtime failures on the hot path never
//! surface as errors: they are logged and reported through outcome enums.

use keepsake_db::DbError;
use keepsake_types::{DataClass, KeyError};

/// Errors raised while creating handlers or registering their keys.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// A module or attribute name violates the naming grammar.
    #[error("invalid name: {0}")]
    InvalidName(#[from] KeyError),

    /// The key is already registered in this data-class.
    #[error("key {module}:{name} is already registered for {class}")]
    DuplicateKey {
        /// Owning module.
        module: String,
        /// Attribute name.
        name: String,
        /// Data-class the key was registered in.
        class: DataClass,
    },

    /// A handler already exists for this module and data-class.
    #[error("a {class} handler for module {module} already exists")]
    DuplicateHandler {
        /// Owning module.
        module: String,
        /// Data-class of the existing handler.
        class: DataClass,
    },

    /// The backing column name is not a valid SQL identifier.
    #[error("invalid backing column: {0}")]
    Column(#[from] DbError),
}
