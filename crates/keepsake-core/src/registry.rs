//! Global key-ownership registry.
//!
//! Every key a handler registers is recorded here under its data-class, so
//! a second registration of the same `module:attribute` is caught, and so
//! cross-module reads can check whether the owner published the key.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use keepsake_types::{DataClass, ModuleName, Value, qualify};
use tracing::warn;

use crate::error::RegistrationError;

/// What the registry knows about one key.
#[derive(Debug, Clone, PartialEq)]
pub struct KeySpec {
    /// Value returned when the key has never been written.
    pub default: Value,
    /// Whether concurrent numeric changes are merged by delta.
    pub tracked: bool,
    /// Whether other modules may read the key.
    pub public: bool,
}

/// Capability to read one public key owned by another module.
///
/// Only [`KeyRegistry::grant_read`] creates grants, and only for keys the
/// owner registered as public.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadGrant {
    requester: ModuleName,
    owner: ModuleName,
    class: DataClass,
    name: String,
}

impl ReadGrant {
    /// Module the grant was issued to.
    pub const fn requester(&self) -> &ModuleName {
        &self.requester
    }

    /// Module that owns the key.
    pub const fn owner(&self) -> &ModuleName {
        &self.owner
    }

    /// Data-class of the key.
    pub const fn class(&self) -> DataClass {
        self.class
    }

    /// Unqualified attribute name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registry of `(data-class, module:attribute)` to [`KeySpec`].
#[derive(Debug, Default)]
pub struct KeyRegistry {
    keys: DashMap<(DataClass, String), KeySpec>,
}

impl KeyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every key in `specs` for `module`, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::DuplicateKey`] if any key is already
    /// claimed. Keys claimed earlier in the same call are released again.
    pub fn claim_all(
        &self,
        class: DataClass,
        module: &ModuleName,
        specs: &[(String, KeySpec)],
    ) -> Result<(), RegistrationError> {
        let mut claimed = Vec::with_capacity(specs.len());
        for (name, spec) in specs {
            let key = (class, qualify(module.as_str(), name));
            // The entry guard must be released before rolling back.
            let taken = match self.keys.entry(key.clone()) {
                Entry::Occupied(_) => true,
                Entry::Vacant(slot) => {
                    slot.insert(spec.clone());
                    false
                }
            };
            if taken {
                for key in &claimed {
                    self.keys.remove(key);
                }
                return Err(RegistrationError::DuplicateKey {
                    module: module.to_string(),
                    name: name.clone(),
                    class,
                });
            }
            claimed.push(key);
        }
        Ok(())
    }

    /// Whether `module:name` is claimed in `class`.
    pub fn is_claimed(&self, class: DataClass, module: &str, name: &str) -> bool {
        self.keys.contains_key(&(class, qualify(module, name)))
    }

    /// Look up a key's spec.
    pub fn lookup(&self, class: DataClass, module: &str, name: &str) -> Option<KeySpec> {
        self.keys
            .get(&(class, qualify(module, name)))
            .map(|spec| spec.value().clone())
    }

    /// Release every key `module` owns in any data-class. Returns the count.
    pub fn release_module(&self, module: &ModuleName) -> usize {
        let prefix = module.key_prefix();
        let before = self.keys.len();
        self.keys.retain(|(_, key), _| !key.starts_with(&prefix));
        before.saturating_sub(self.keys.len())
    }

    /// Issue a [`ReadGrant`] if `owner` registered `name` as public.
    ///
    /// Denials are logged and return `None`.
    pub fn grant_read(
        &self,
        requester: &ModuleName,
        owner: &ModuleName,
        class: DataClass,
        name: &str,
    ) -> Option<ReadGrant> {
        match self.lookup(class, owner.as_str(), name) {
            Some(spec) if spec.public || requester == owner => Some(ReadGrant {
                requester: requester.clone(),
                owner: owner.clone(),
                class,
                name: name.to_owned(),
            }),
            Some(_) => {
                warn!(
                    requester = requester.as_str(),
                    owner = owner.as_str(),
                    %class,
                    name,
                    "Denied cross-module read of private key"
                );
                None
            }
            None => {
                warn!(
                    requester = requester.as_str(),
                    owner = owner.as_str(),
                    %class,
                    name,
                    "Denied cross-module read of unregistered key"
                );
                None
            }
        }
    }

    /// Number of claimed keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no keys are claimed.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
