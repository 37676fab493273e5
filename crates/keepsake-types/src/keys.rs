//! Naming grammar for modules and attributes.
//!
//! Attribute keys are stored in the cache fully qualified as
//! `module:attribute`. Both halves follow the same grammar -- ASCII
//! alphanumerics and underscores, at most [`MAX_NAME_LEN`] bytes -- so the
//! `:` separator and the `.` used in backing column names can never appear
//! inside a name.

use serde::{Deserialize, Serialize};

/// Separator between the module and attribute halves of a qualified key.
pub const KEY_SEPARATOR: char = ':';

/// Longest accepted module or attribute name.
pub const MAX_NAME_LEN: usize = 64;

/// Errors raised by name validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// The name is empty.
    #[error("{what} name must not be empty")]
    Empty {
        /// Which kind of name was rejected.
        what: &'static str,
    },

    /// The name exceeds [`MAX_NAME_LEN`].
    #[error("{what} name {name:?} is longer than {MAX_NAME_LEN} bytes")]
    TooLong {
        /// Which kind of name was rejected.
        what: &'static str,
        /// The rejected name.
        name: String,
    },

    /// The name contains a character outside `[A-Za-z0-9_]`.
    #[error("{what} name {name:?} contains invalid character {found:?}")]
    InvalidCharacter {
        /// Which kind of name was rejected.
        what: &'static str,
        /// The rejected name.
        name: String,
        /// First offending character.
        found: char,
    },
}

fn validate(name: &str, what: &'static str) -> Result<(), KeyError> {
    if name.is_empty() {
        return Err(KeyError::Empty { what });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(KeyError::TooLong {
            what,
            name: name.to_owned(),
        });
    }
    if let Some(found) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        return Err(KeyError::InvalidCharacter {
            what,
            name: name.to_owned(),
            found,
        });
    }
    Ok(())
}

/// Check an unqualified attribute name against the naming grammar.
///
/// # Errors
///
/// Returns a [`KeyError`] describing the first violation.
pub fn validate_attribute_name(name: &str) -> Result<(), KeyError> {
    validate(name, "attribute")
}

/// A validated owning-module name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleName(String);

impl ModuleName {
    /// Validate and wrap a module name.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if the name violates the grammar.
    pub fn new(name: impl Into<String>) -> Result<Self, KeyError> {
        let name = name.into();
        validate(&name, "module")?;
        Ok(Self(name))
    }

    /// Borrow the name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix shared by every qualified key this module owns (`module:`).
    pub fn key_prefix(&self) -> String {
        format!("{}{KEY_SEPARATOR}", self.0)
    }
}

impl TryFrom<String> for ModuleName {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ModuleName> for String {
    fn from(value: ModuleName) -> Self {
        value.0
    }
}

impl AsRef<str> for ModuleName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ModuleName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build the fully-qualified cache key `module:name`.
pub fn qualify(module: &str, name: &str) -> String {
    let mut key = String::with_capacity(module.len().saturating_add(name.len()).saturating_add(1));
    key.push_str(module);
    key.push(KEY_SEPARATOR);
    key.push_str(name);
    key
}
