//! Shared type definitions for the Keepsake data engine.
//!
//! Every crate in the workspace speaks in terms of the types defined here:
//! entity identifiers, the two attribute namespaces ([`DataClass`]), the
//! dynamically typed attribute [`Value`], and the naming grammar for
//! modules and attributes.
//!
//! # Modules
//!
//! - [`ids`] -- [`EntityId`], [`DataClass`], and the composite [`CacheKey`]
//! - [`value`] -- the closed [`Value`] union and its JSON mapping
//! - [`convert`] -- the [`Attribute`] conversion trait for typed get/set
//! - [`keys`] -- name validation and fully-qualified key helpers

pub mod convert;
pub mod ids;
pub mod keys;
pub mod value;

pub use convert::{Attribute, Structured};
pub use ids::{CacheKey, DataClass, EntityId};
pub use keys::{KeyError, ModuleName, qualify, validate_attribute_name};
pub use value::{Value, ValueError};
