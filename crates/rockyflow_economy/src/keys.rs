//! Catalog key types.
//!
//! Every entity in the progression catalog is addressed by a string key.
//! Each namespace gets its own newtype so an ore key can never be passed
//! where an item key is expected. Keys are validated against the catalog
//! at load time; a key that reaches the ledger is either known or rejected
//! with the matching `Unknown*` error.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

macro_rules! catalog_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a key from any string-like value.
            #[must_use]
            pub fn new(key: impl Into<String>) -> Self {
                Self(key.into())
            }

            /// Returns the key as a string slice.
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(key: &str) -> Self {
                Self::new(key)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

catalog_key!(
    /// Key into the inventory namespace: ores' drop items, processed goods
    /// and gear all share it.
    ItemKey
);

catalog_key!(
    /// Key of a mineable ore.
    OreKey
);

catalog_key!(
    /// Key of a mine location.
    MineKey
);

catalog_key!(
    /// Key of a processing recipe.
    RecipeKey
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_keys_serialize_as_plain_strings() {
        let key = ItemKey::new("coal");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"coal\"");
        let back: ItemKey = serde_json::from_str("\"coal\"").unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_lookup_by_str() {
        let mut map = BTreeMap::new();
        map.insert(MineKey::new("starter_mine"), 1);
        assert_eq!(map.get("starter_mine"), Some(&1));
    }
}
