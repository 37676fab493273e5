//! Validated SQL identifiers.
//!
//! Table and column names are interpolated into DDL and DML text, so they
//! never come straight from external input. A [`SqlIdent`] only admits
//! `[A-Za-z0-9_.]`, must not start with a digit or a dot, and fits in
//! `PostgreSQL`'s 63-byte identifier limit. It is always emitted quoted.

use keepsake_types::{DataClass, ModuleName};

use crate::error::DbError;

/// `PostgreSQL` truncates identifiers beyond this length.
pub const MAX_IDENT_LEN: usize = 63;

/// A table or column name that is safe to interpolate into SQL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SqlIdent(String);

impl SqlIdent {
    /// Validate `name` against the identifier allow-list.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidIdentifier`] if the name is empty, too
    /// long, starts with a digit or dot, or contains any other character.
    pub fn new(name: impl Into<String>) -> Result<Self, DbError> {
        let name = name.into();
        let valid_start = name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_chars = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid_start || !valid_chars || name.len() > MAX_IDENT_LEN {
            return Err(DbError::InvalidIdentifier(name));
        }
        Ok(Self(name))
    }

    /// Column owned by a (module, data-class) handler: `module.class`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidIdentifier`] if the combined name is too long.
    pub fn column_for(module: &ModuleName, class: DataClass) -> Result<Self, DbError> {
        Self::new(format!("{}.{}", module.as_str(), class.as_str()))
    }

    /// Borrow the bare name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name wrapped in double quotes, ready for SQL text.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl core::fmt::Display for SqlIdent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_table_and_column_names() {
        assert!(SqlIdent::new("player_data").is_ok());
        assert!(SqlIdent::new("_private").is_ok());
        assert!(SqlIdent::new("economy.storage").is_ok());
    }

    #[test]
    fn rejects_injection_attempts() {
        for bad in [
            "",
            "1table",
            ".hidden",
            "players; DROP TABLE x",
            "name\"",
            "with space",
            "dash-name",
        ] {
            assert!(SqlIdent::new(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(SqlIdent::new("a".repeat(MAX_IDENT_LEN + 1)).is_err());
    }

    #[test]
    fn handler_columns_combine_module_and_class() {
        let module = ModuleName::new("economy").ok();
        let column = module.and_then(|m| SqlIdent::column_for(&m, DataClass::Settings).ok());
        assert_eq!(
            column.map(|c| c.quoted()),
            Some("\"economy.settings\"".to_owned())
        );
    }
}
