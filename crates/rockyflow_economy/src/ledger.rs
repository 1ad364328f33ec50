//! # Economy Ledger
//!
//! **Nothing changes hands without our approval.**
//!
//! Applies rewards to player records and runs every exchange: gear
//! purchases, item sales and recipe processing. Each operation is a single
//! [`RecordStore::transact`] call, so balance and inventory change together
//! or not at all.
//!
//! ## Invariants
//!
//! - `currency` never goes negative: a debit is checked before it happens
//! - gear is never owned twice: purchase fails with `AlreadyOwned`
//! - all credits are checked: a wrapping sum is `ArithmeticOverflow`

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::crafting::ProcessOutput;
use crate::error::{EconomyError, EconomyResult};
use crate::inventory::ItemCounts;
use crate::keys::{ItemKey, RecipeKey};
use crate::record::{PlayerId, PlayerRecord};
use crate::store::RecordStore;

// ============================================================================
// Receipts and listings
// ============================================================================

/// Result of a successful gear purchase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurchaseReceipt {
    /// Gear bought.
    pub gear: ItemKey,
    /// Display name of the gear.
    pub name: String,
    /// Price paid.
    pub price: u64,
    /// Balance after the purchase.
    pub currency: u64,
}

/// One sold stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoldLine {
    /// Item sold.
    pub item: ItemKey,
    /// Display name.
    pub name: String,
    /// Units sold.
    pub count: u64,
    /// Price per unit.
    pub unit_price: u64,
    /// `count * unit_price`.
    pub proceeds: u64,
}

/// Result of a successful sale.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaleReceipt {
    /// Stacks sold, in request order.
    pub lines: Vec<SoldLine>,
    /// Sum of all line proceeds.
    pub proceeds: u64,
    /// Balance after the sale.
    pub currency: u64,
}

/// Result of running a recipe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessReceipt {
    /// What was consumed and produced.
    pub output: ProcessOutput,
    /// Experience total after the run.
    pub experience: u64,
}

/// A gear shop entry as seen by one player.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShopListing {
    /// Gear key.
    pub gear: ItemKey,
    /// Display name.
    pub name: String,
    /// Price.
    pub price: u64,
    /// Already in the player's inventory.
    pub owned: bool,
    /// Not owned and the balance covers the price.
    pub affordable: bool,
}

/// A held item that can be sold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SellableListing {
    /// Item key.
    pub item: ItemKey,
    /// Display name.
    pub name: String,
    /// Emoji from the catalog, possibly empty.
    pub emoji: String,
    /// Units held.
    pub count: u64,
    /// Price per unit.
    pub unit_price: u64,
    /// Value of the whole stack (saturating).
    pub total: u64,
}

/// A recipe as seen by one player.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecipeListing {
    /// Recipe key.
    pub recipe: RecipeKey,
    /// Display name.
    pub name: String,
    /// Inputs per run.
    pub inputs: ItemCounts,
    /// Outputs per run.
    pub outputs: ItemCounts,
    /// Experience per run.
    pub xp: u64,
    /// Runs the player's inventory currently allows.
    pub max_runs: u64,
}

// ============================================================================
// The ledger
// ============================================================================

/// Applies economic operations to player records.
pub struct EconomyLedger {
    catalog: Arc<Catalog>,
    store: Arc<RecordStore>,
}

impl EconomyLedger {
    /// Creates a ledger over the given catalog and store.
    #[must_use]
    pub fn new(catalog: Arc<Catalog>, store: Arc<RecordStore>) -> Self {
        Self { catalog, store }
    }

    /// Adds drops and experience to `record` in place.
    ///
    /// Either both are applied or, on overflow, neither.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::ArithmeticOverflow` if a count or the
    /// experience total would wrap.
    pub fn apply_rewards(record: &mut PlayerRecord, drops: &ItemCounts, xp: u64) -> EconomyResult<()> {
        let experience = record.experience.checked_add(xp).ok_or(EconomyError::ArithmeticOverflow)?;
        record.inventory.merge(drops)?;
        record.experience = experience;
        Ok(())
    }

    /// Credits session rewards to a player and persists them.
    ///
    /// # Errors
    ///
    /// `NotFound`, `ArithmeticOverflow`, or `StorageUnavailable`.
    pub fn credit_session_rewards(
        &self,
        player_id: PlayerId,
        drops: &ItemCounts,
        xp: u64,
    ) -> EconomyResult<PlayerRecord> {
        let record = self.store.transact(player_id, |record| {
            Self::apply_rewards(record, drops, xp)?;
            Ok(record.clone())
        })?;
        tracing::info!(player_id, drops = drops.values().sum::<u64>(), xp, "rewards credited");
        Ok(record)
    }

    /// Buys one unit of a gear tier from the shop.
    ///
    /// # Errors
    ///
    /// - `UnknownGear` if the shop does not sell it
    /// - `AlreadyOwned` if the player holds one
    /// - `InsufficientFunds` if the balance is below the price; nothing is
    ///   debited
    pub fn purchase_gear(&self, player_id: PlayerId, gear: &str) -> EconomyResult<PurchaseReceipt> {
        let price = self
            .catalog
            .gear_price(gear)
            .ok_or_else(|| EconomyError::UnknownGear(gear.to_string()))?;
        let key = ItemKey::new(gear);

        let receipt = self.store.transact(player_id, |record| {
            if record.inventory.owns(gear) {
                return Err(EconomyError::AlreadyOwned(gear.to_string()));
            }
            if record.currency < price {
                return Err(EconomyError::InsufficientFunds {
                    required: price,
                    available: record.currency,
                });
            }
            record.currency -= price;
            record.inventory.set(&key, 1);
            Ok(PurchaseReceipt {
                gear: key.clone(),
                name: self.catalog.display_name(gear).to_string(),
                price,
                currency: record.currency,
            })
        })?;

        tracing::info!(player_id, gear, price, currency = receipt.currency, "gear purchased");
        Ok(receipt)
    }

    /// Sells every unit of each listed item that has a sell price.
    ///
    /// Items that are unknown, unsellable or not held are skipped. A key
    /// listed twice is sold once.
    ///
    /// # Errors
    ///
    /// - `NothingToSell` if the listed items are worth nothing in total
    /// - `ArithmeticOverflow` if proceeds or the new balance would wrap
    pub fn sell_items(&self, player_id: PlayerId, items: &[ItemKey]) -> EconomyResult<SaleReceipt> {
        let receipt = self.store.transact(player_id, |record| {
            let mut lines = Vec::new();
            let mut proceeds: u64 = 0;

            for item in items {
                let Some(unit_price) = self.catalog.sell_price(item.as_str()) else {
                    continue;
                };
                let count = record.inventory.count(item.as_str());
                if count == 0 {
                    continue;
                }
                let line = count.checked_mul(unit_price).ok_or(EconomyError::ArithmeticOverflow)?;
                proceeds = proceeds.checked_add(line).ok_or(EconomyError::ArithmeticOverflow)?;
                record.inventory.take_all(item.as_str());
                lines.push(SoldLine {
                    item: item.clone(),
                    name: self.catalog.display_name(item.as_str()).to_string(),
                    count,
                    unit_price,
                    proceeds: line,
                });
            }

            if proceeds == 0 {
                return Err(EconomyError::NothingToSell);
            }
            record.currency = record.currency.checked_add(proceeds).ok_or(EconomyError::ArithmeticOverflow)?;
            Ok(SaleReceipt {
                lines,
                proceeds,
                currency: record.currency,
            })
        })?;

        tracing::info!(
            player_id,
            stacks = receipt.lines.len(),
            proceeds = receipt.proceeds,
            currency = receipt.currency,
            "items sold"
        );
        Ok(receipt)
    }

    /// Sells every sellable item the player holds.
    ///
    /// # Errors
    ///
    /// Same as [`sell_items`](Self::sell_items).
    pub fn sell_all(&self, player_id: PlayerId) -> EconomyResult<SaleReceipt> {
        let items: Vec<ItemKey> = self
            .list_sellable(player_id)?
            .into_iter()
            .map(|listing| listing.item)
            .collect();
        self.sell_items(player_id, &items)
    }

    /// Runs a processing recipe `times` times.
    ///
    /// # Errors
    ///
    /// `UnknownRecipe`, `InvalidQuantity`, `InsufficientMaterials` or
    /// `ArithmeticOverflow`; the record is unchanged on any error.
    pub fn process(&self, player_id: PlayerId, recipe: &str, times: u64) -> EconomyResult<ProcessReceipt> {
        let receipt = self.store.transact(player_id, |record| {
            let output = self.catalog.recipes().process(&mut record.inventory, recipe, times)?;
            record.experience = record
                .experience
                .checked_add(output.xp)
                .ok_or(EconomyError::ArithmeticOverflow)?;
            Ok(ProcessReceipt {
                output,
                experience: record.experience,
            })
        })?;

        tracing::info!(player_id, recipe, times, xp = receipt.output.xp, "recipe processed");
        Ok(receipt)
    }

    /// The gear shop from the player's point of view, weakest tier first.
    ///
    /// # Errors
    ///
    /// `NotFound` or `StorageUnavailable`.
    pub fn list_shop(&self, player_id: PlayerId) -> EconomyResult<Vec<ShopListing>> {
        let record = self.store.get(player_id)?;
        Ok(self
            .catalog
            .gear_shop()
            .map(|(gear, price)| {
                let owned = record.inventory.owns(gear.as_str());
                ShopListing {
                    gear: gear.clone(),
                    name: self.catalog.display_name(gear.as_str()).to_string(),
                    price,
                    owned,
                    affordable: !owned && record.currency >= price,
                }
            })
            .collect())
    }

    /// Held items that have a sell price, in key order.
    ///
    /// # Errors
    ///
    /// `NotFound` or `StorageUnavailable`.
    pub fn list_sellable(&self, player_id: PlayerId) -> EconomyResult<Vec<SellableListing>> {
        let record = self.store.get(player_id)?;
        Ok(record
            .inventory
            .iter()
            .filter_map(|(item, count)| {
                let def = self.catalog.item(item.as_str())?;
                let unit_price = def.sell_price?;
                Some(SellableListing {
                    item: item.clone(),
                    name: def.name.clone(),
                    emoji: def.emoji.clone(),
                    count,
                    unit_price,
                    total: count.saturating_mul(unit_price),
                })
            })
            .collect())
    }

    /// Every recipe with how many times the player can currently run it.
    ///
    /// # Errors
    ///
    /// `NotFound` or `StorageUnavailable`.
    pub fn list_recipes(&self, player_id: PlayerId) -> EconomyResult<Vec<RecipeListing>> {
        let record = self.store.get(player_id)?;
        let book = self.catalog.recipes();
        Ok(book
            .all_recipes()
            .map(|recipe| RecipeListing {
                recipe: recipe.key.clone(),
                name: recipe.name.clone(),
                inputs: recipe.inputs.clone(),
                outputs: recipe.outputs.clone(),
                xp: recipe.xp,
                max_runs: book.max_runs(&record.inventory, recipe.key.as_str()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::test_catalog;
    use crate::record::PlayerUpdate;
    use std::time::Duration;

    fn setup() -> (EconomyLedger, Arc<RecordStore>) {
        let catalog = Arc::new(test_catalog());
        let store = Arc::new(RecordStore::in_memory(catalog.starter().clone(), Duration::from_millis(200)));
        (EconomyLedger::new(Arc::clone(&catalog), Arc::clone(&store)), store)
    }

    fn counts(entries: &[(&str, u64)]) -> ItemCounts {
        entries.iter().map(|&(k, q)| (ItemKey::new(k), q)).collect()
    }

    fn with_currency(store: &RecordStore, player_id: PlayerId, currency: u64) {
        store.apply(player_id, PlayerUpdate::new().currency(currency)).unwrap();
    }

    #[test]
    fn test_purchase_exact_balance() {
        let (ledger, store) = setup();
        with_currency(&store, 1, 50);

        let receipt = ledger.purchase_gear(1, "stone_pickaxe").unwrap();
        assert_eq!(receipt.price, 50);
        assert_eq!(receipt.currency, 0);

        let record = store.get(1).unwrap();
        assert_eq!(record.currency, 0);
        assert_eq!(record.inventory.count("stone_pickaxe"), 1);

        assert_eq!(
            ledger.purchase_gear(1, "stone_pickaxe"),
            Err(EconomyError::AlreadyOwned("stone_pickaxe".into()))
        );
    }

    #[test]
    fn test_purchase_insufficient_funds_debits_nothing() {
        let (ledger, store) = setup();
        with_currency(&store, 1, 49);

        assert_eq!(
            ledger.purchase_gear(1, "stone_pickaxe"),
            Err(EconomyError::InsufficientFunds { required: 50, available: 49 })
        );
        let record = store.get(1).unwrap();
        assert_eq!(record.currency, 49);
        assert!(!record.inventory.owns("stone_pickaxe"));
    }

    #[test]
    fn test_purchase_unknown_gear() {
        let (ledger, store) = setup();
        store.ensure_exists(1).unwrap();
        assert_eq!(
            ledger.purchase_gear(1, "wooden_pickaxe"),
            Err(EconomyError::UnknownGear("wooden_pickaxe".into()))
        );
    }

    #[test]
    fn test_sell_credits_and_zeroes() {
        let (ledger, store) = setup();
        store.ensure_exists(1).unwrap();
        ledger.credit_session_rewards(1, &counts(&[("coal", 3)]), 0).unwrap();

        let receipt = ledger.sell_items(1, &[ItemKey::new("coal")]).unwrap();
        assert_eq!(receipt.proceeds, 3);
        assert_eq!(receipt.currency, 3);
        assert_eq!(store.get(1).unwrap().inventory.count("coal"), 0);

        assert_eq!(ledger.sell_items(1, &[ItemKey::new("coal")]), Err(EconomyError::NothingToSell));
        assert_eq!(store.get(1).unwrap().currency, 3);
    }

    #[test]
    fn test_sell_skips_unsellable_and_missing() {
        let (ledger, store) = setup();
        store.ensure_exists(1).unwrap();
        ledger.credit_session_rewards(1, &counts(&[("iron", 2)]), 0).unwrap();

        let receipt = ledger
            .sell_items(
                1,
                &[
                    ItemKey::new("wooden_pickaxe"),
                    ItemKey::new("coal"),
                    ItemKey::new("iron"),
                    ItemKey::new("iron"),
                    ItemKey::new("unobtainium"),
                ],
            )
            .unwrap();
        assert_eq!(receipt.lines.len(), 1);
        assert_eq!(receipt.proceeds, 6);

        let record = store.get(1).unwrap();
        assert!(record.inventory.owns("wooden_pickaxe"));
        assert_eq!(record.currency, 6);
    }

    #[test]
    fn test_sell_overflow_rolls_back() {
        let (ledger, store) = setup();
        with_currency(&store, 1, u64::MAX - 1);
        ledger.credit_session_rewards(1, &counts(&[("coal", 5)]), 0).unwrap();

        assert_eq!(ledger.sell_items(1, &[ItemKey::new("coal")]), Err(EconomyError::ArithmeticOverflow));
        let record = store.get(1).unwrap();
        assert_eq!(record.inventory.count("coal"), 5);
        assert_eq!(record.currency, u64::MAX - 1);
    }

    #[test]
    fn test_sell_all() {
        let (ledger, store) = setup();
        store.ensure_exists(1).unwrap();
        ledger.credit_session_rewards(1, &counts(&[("coal", 4), ("iron", 1)]), 0).unwrap();

        let receipt = ledger.sell_all(1).unwrap();
        assert_eq!(receipt.proceeds, 7);
        assert!(ledger.list_sellable(1).unwrap().is_empty());
    }

    #[test]
    fn test_rewards_are_additive() {
        let (ledger, store) = setup();
        store.ensure_exists(1).unwrap();
        ledger.credit_session_rewards(1, &counts(&[("coal", 2)]), 4).unwrap();
        let record = ledger.credit_session_rewards(1, &counts(&[("coal", 3), ("iron", 1)]), 11).unwrap();
        assert_eq!(record.inventory.count("coal"), 5);
        assert_eq!(record.inventory.count("iron"), 1);
        assert_eq!(record.experience, 15);
    }

    #[test]
    fn test_process_recipe() {
        let (ledger, store) = setup();
        store.ensure_exists(1).unwrap();
        ledger.credit_session_rewards(1, &counts(&[("iron", 7), ("coal", 5)]), 0).unwrap();

        let receipt = ledger.process(1, "iron_ingot", 2).unwrap();
        assert_eq!(receipt.output.produced, counts(&[("iron_ingot", 2)]));
        assert_eq!(receipt.experience, 16);

        let record = store.get(1).unwrap();
        assert_eq!(record.inventory.count("iron"), 1);
        assert_eq!(record.inventory.count("coal"), 3);

        assert!(matches!(
            ledger.process(1, "iron_ingot", 1),
            Err(EconomyError::InsufficientMaterials { .. })
        ));
        assert_eq!(ledger.process(1, "iron_ingot", 0), Err(EconomyError::InvalidQuantity(0)));
        assert_eq!(store.get(1).unwrap(), record);
    }

    #[test]
    fn test_listings() {
        let (ledger, store) = setup();
        with_currency(&store, 1, 60);
        ledger.credit_session_rewards(1, &counts(&[("iron", 6), ("coal", 1)]), 0).unwrap();

        let shop = ledger.list_shop(1).unwrap();
        assert_eq!(shop.len(), 1);
        assert!(shop[0].affordable);
        assert!(!shop[0].owned);

        let sellable = ledger.list_sellable(1).unwrap();
        let keys: Vec<_> = sellable.iter().map(|l| l.item.as_str()).collect();
        assert_eq!(keys, vec!["coal", "iron"]);
        assert_eq!(sellable[1].total, 18);

        let recipes = ledger.list_recipes(1).unwrap();
        assert_eq!(recipes[0].max_runs, 1);
    }
}
