//! # Inventory System
//!
//! Item counts keyed by catalog item key.
//!
//! Absence means zero: a slot that drops to zero is removed, so two
//! inventories holding the same goods always compare equal and serialize
//! identically. All arithmetic is checked; counts can never go negative
//! and never wrap.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{EconomyError, EconomyResult};
use crate::keys::ItemKey;

/// A multiset of items, used both for player inventories and for loot drops.
pub type ItemCounts = BTreeMap<ItemKey, u64>;

/// A player's inventory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Inventory {
    counts: ItemCounts,
}

impl Inventory {
    /// Creates a new empty inventory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct items held.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// True if nothing is held.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Counts a specific item. Missing items count as zero.
    #[must_use]
    pub fn count(&self, item: &str) -> u64 {
        self.counts.get(item).copied().unwrap_or(0)
    }

    /// True if at least one of the item is held.
    #[must_use]
    pub fn owns(&self, item: &str) -> bool {
        self.count(item) > 0
    }

    /// Iterates over held items in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&ItemKey, u64)> {
        self.counts.iter().map(|(key, &count)| (key, count))
    }

    /// Adds items to the inventory.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::ArithmeticOverflow` if the count would wrap.
    pub fn add(&mut self, item: &ItemKey, count: u64) -> EconomyResult<()> {
        if count == 0 {
            return Ok(());
        }
        let slot = self.counts.entry(item.clone()).or_insert(0);
        *slot = slot.checked_add(count).ok_or(EconomyError::ArithmeticOverflow)?;
        Ok(())
    }

    /// Removes items from the inventory.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::InsufficientMaterials` if not enough items.
    pub fn remove(&mut self, item: &ItemKey, count: u64) -> EconomyResult<()> {
        let available = self.count(item.as_str());
        if available < count {
            return Err(EconomyError::InsufficientMaterials {
                item: item.to_string(),
                required: count,
                available,
            });
        }
        self.set(item, available - count);
        Ok(())
    }

    /// Overwrites the count for an item. Zero removes the slot.
    pub fn set(&mut self, item: &ItemKey, count: u64) {
        if count == 0 {
            self.counts.remove(item.as_str());
        } else {
            self.counts.insert(item.clone(), count);
        }
    }

    /// Removes the whole stack of an item and returns how many there were.
    pub fn take_all(&mut self, item: &str) -> u64 {
        self.counts.remove(item).unwrap_or(0)
    }

    /// Adds every count in `items` (a loot drop or recipe output).
    ///
    /// Either all counts are added or, on overflow, the inventory is left
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::ArithmeticOverflow` if any count would wrap.
    pub fn merge(&mut self, items: &ItemCounts) -> EconomyResult<()> {
        let snapshot = self.clone();
        for (item, &count) in items {
            if let Err(e) = self.add(item, count) {
                *self = snapshot;
                return Err(e);
            }
        }
        Ok(())
    }
}

impl FromIterator<(ItemKey, u64)> for Inventory {
    fn from_iter<I: IntoIterator<Item = (ItemKey, u64)>>(iter: I) -> Self {
        let mut inventory = Self::new();
        for (item, count) in iter {
            inventory.set(&item, count);
        }
        inventory
    }
}
