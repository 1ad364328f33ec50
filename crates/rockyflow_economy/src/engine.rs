//! # Mining Engine
//!
//! The single entry point the presentation layer calls. Every command:
//!
//! 1. makes sure the player has a record (get-or-create)
//! 2. runs the operation against the session manager or the ledger
//! 3. retries once if storage was briefly unavailable
//!
//! Player-facing errors come back unchanged for the caller to render.
//!
//! ```rust,ignore
//! let config = EngineConfig::load("data/rockyflow.toml")?;
//! let engine = MiningEngine::open(&config)?;
//!
//! engine.start_session(player_id)?;
//! // ... later
//! let report = engine.close_session(player_id)?;
//! ```

use chrono::{DateTime, Utc};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::error::EconomyResult;
use crate::inventory::Inventory;
use crate::keys::{ItemKey, MineKey};
use crate::ledger::{
    EconomyLedger, ProcessReceipt, PurchaseReceipt, RecipeListing, SaleReceipt, SellableListing, ShopListing,
};
use crate::loot::LootResolver;
use crate::record::PlayerId;
use crate::session::{Clock, MineListing, SessionManager, SessionReport, SessionStart, SystemClock, TravelReceipt};
use crate::store::RecordStore;

/// Everything a player can see about themselves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerSnapshot {
    /// Player.
    pub player_id: PlayerId,
    /// Held items.
    pub inventory: Inventory,
    /// Experience total.
    pub experience: u64,
    /// Level derived from experience.
    pub level: u32,
    /// Balance.
    pub currency: u64,
    /// Current mine.
    pub mine: MineKey,
    /// Display name of the current mine.
    pub mine_name: String,
    /// Strongest gear held.
    pub gear: Option<ItemKey>,
    /// Start of the open session, if any.
    pub session_start: Option<DateTime<Utc>>,
    /// Time the open session has run so far.
    pub session_elapsed: Option<Duration>,
}

/// Facade over the session manager, ledger and record store.
pub struct MiningEngine {
    catalog: Arc<Catalog>,
    store: Arc<RecordStore>,
    clock: Arc<dyn Clock>,
    sessions: SessionManager,
    ledger: EconomyLedger,
}

impl MiningEngine {
    /// Loads the catalog, opens the player log and builds an engine with the
    /// system clock.
    ///
    /// # Errors
    ///
    /// `CatalogLoad`, `InvalidConfig`, `CorruptStorage` or
    /// `StorageUnavailable`.
    pub fn open(config: &EngineConfig) -> EconomyResult<Self> {
        config.validate()?;
        let catalog = Arc::new(Catalog::load(&config.catalog_path)?);
        let store = Arc::new(
            RecordStore::open(config.store_path(), catalog.starter().clone(), config.lock_timeout())?
                .with_compaction_threshold(config.compact_threshold_bytes),
        );
        Ok(Self::new(catalog, store, config))
    }

    /// Builds an engine over an existing catalog and store, with the system
    /// clock and a ChaCha seed source seeded from `config.rng_seed` or the OS.
    #[must_use]
    pub fn new(catalog: Arc<Catalog>, store: Arc<RecordStore>, config: &EngineConfig) -> Self {
        let seeds = config
            .rng_seed
            .map_or_else(ChaCha8Rng::from_entropy, ChaCha8Rng::seed_from_u64);
        Self::with_parts(catalog, store, Arc::new(SystemClock), Box::new(seeds), config.max_draws)
    }

    /// Builds an engine from explicit parts. `seeds` yields one seed per
    /// closed session.
    #[must_use]
    pub fn with_parts(
        catalog: Arc<Catalog>,
        store: Arc<RecordStore>,
        clock: Arc<dyn Clock>,
        seeds: Box<dyn RngCore + Send>,
        max_draws: u64,
    ) -> Self {
        let resolver = LootResolver::new(Arc::clone(&catalog), max_draws);
        let sessions = SessionManager::new(
            Arc::clone(&catalog),
            Arc::clone(&store),
            resolver,
            Arc::clone(&clock),
            seeds,
        );
        let ledger = EconomyLedger::new(Arc::clone(&catalog), Arc::clone(&store));
        Self {
            catalog,
            store,
            clock,
            sessions,
            ledger,
        }
    }

    /// The loaded catalog.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The record store.
    #[must_use]
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Opens a mining session.
    ///
    /// # Errors
    ///
    /// `SessionAlreadyActive` or `StorageUnavailable`.
    pub fn start_session(&self, player_id: PlayerId) -> EconomyResult<SessionStart> {
        self.command("start_session", player_id, || self.sessions.start_session(player_id))
    }

    /// Closes the mining session and credits its loot.
    ///
    /// # Errors
    ///
    /// `NoActiveSession`, `ArithmeticOverflow` or `StorageUnavailable`.
    pub fn close_session(&self, player_id: PlayerId) -> EconomyResult<SessionReport> {
        self.command("close_session", player_id, || self.sessions.close_session(player_id))
    }

    /// The player's stats, inventory and session state.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable`.
    pub fn view_stats(&self, player_id: PlayerId) -> EconomyResult<PlayerSnapshot> {
        let record = self.command("view_stats", player_id, || self.store.get(player_id))?;
        let session_elapsed = record
            .session_start
            .map(|start| (self.clock.now() - start).to_std().unwrap_or(Duration::ZERO));
        Ok(PlayerSnapshot {
            player_id,
            level: record.level(),
            gear: self.catalog.effective_gear(&record.inventory).cloned(),
            mine_name: self
                .catalog
                .mine(record.current_mine.as_str())
                .map_or_else(|| record.current_mine.to_string(), |mine| mine.name.clone()),
            experience: record.experience,
            currency: record.currency,
            mine: record.current_mine,
            session_start: record.session_start,
            inventory: record.inventory,
            session_elapsed,
        })
    }

    /// The gear shop from the player's point of view.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable`.
    pub fn list_shop(&self, player_id: PlayerId) -> EconomyResult<Vec<ShopListing>> {
        self.command("list_shop", player_id, || self.ledger.list_shop(player_id))
    }

    /// Buys a gear tier.
    ///
    /// # Errors
    ///
    /// `UnknownGear`, `AlreadyOwned`, `InsufficientFunds` or
    /// `StorageUnavailable`.
    pub fn purchase(&self, player_id: PlayerId, gear: &str) -> EconomyResult<PurchaseReceipt> {
        self.command("purchase", player_id, || self.ledger.purchase_gear(player_id, gear))
    }

    /// Held items that can be sold.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable`.
    pub fn list_sellable(&self, player_id: PlayerId) -> EconomyResult<Vec<SellableListing>> {
        self.command("list_sellable", player_id, || self.ledger.list_sellable(player_id))
    }

    /// Sells the listed items.
    ///
    /// # Errors
    ///
    /// `NothingToSell`, `ArithmeticOverflow` or `StorageUnavailable`.
    pub fn sell(&self, player_id: PlayerId, items: &[ItemKey]) -> EconomyResult<SaleReceipt> {
        self.command("sell", player_id, || self.ledger.sell_items(player_id, items))
    }

    /// Sells everything sellable.
    ///
    /// # Errors
    ///
    /// `NothingToSell`, `ArithmeticOverflow` or `StorageUnavailable`.
    pub fn sell_all(&self, player_id: PlayerId) -> EconomyResult<SaleReceipt> {
        self.command("sell_all", player_id, || self.ledger.sell_all(player_id))
    }

    /// Every mine with the player's access to it.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable`.
    pub fn list_mines(&self, player_id: PlayerId) -> EconomyResult<Vec<MineListing>> {
        self.command("list_mines", player_id, || self.sessions.list_mines(player_id))
    }

    /// Moves the player to another mine.
    ///
    /// # Errors
    ///
    /// `UnknownMine`, `MineLocked`, `SessionInProgress` or
    /// `StorageUnavailable`.
    pub fn travel(&self, player_id: PlayerId, mine: &str) -> EconomyResult<TravelReceipt> {
        self.command("travel", player_id, || self.sessions.travel(player_id, mine))
    }

    /// Every recipe with how often the player can run it.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable`.
    pub fn list_recipes(&self, player_id: PlayerId) -> EconomyResult<Vec<RecipeListing>> {
        self.command("list_recipes", player_id, || self.ledger.list_recipes(player_id))
    }

    /// Runs a recipe `times` times.
    ///
    /// # Errors
    ///
    /// `UnknownRecipe`, `InvalidQuantity`, `InsufficientMaterials`,
    /// `ArithmeticOverflow` or `StorageUnavailable`.
    pub fn process(&self, player_id: PlayerId, recipe: &str, times: u64) -> EconomyResult<ProcessReceipt> {
        self.command("process", player_id, || self.ledger.process(player_id, recipe, times))
    }

    /// Rewrites the player log down to current state.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable`.
    pub fn compact(&self) -> EconomyResult<()> {
        self.store.compact()
    }

    /// Ensures the player exists, then runs `op`, retrying once on a
    /// retryable error.
    fn command<T>(
        &self,
        name: &'static str,
        player_id: PlayerId,
        op: impl Fn() -> EconomyResult<T>,
    ) -> EconomyResult<T> {
        let attempt = || {
            self.store.ensure_exists(player_id)?;
            op()
        };
        match attempt() {
            Err(e) if e.is_retryable() => {
                tracing::warn!(command = name, player_id, error = %e, "storage unavailable, retrying once");
                attempt()
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::test_catalog;
    use crate::error::EconomyError;
    use crate::session::ManualClock;
    use chrono::TimeZone;
    use rand::rngs::mock::StepRng;

    fn engine() -> (MiningEngine, Arc<ManualClock>) {
        let catalog = Arc::new(test_catalog());
        let store = Arc::new(RecordStore::in_memory(catalog.starter().clone(), Duration::from_millis(200)));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()));
        let engine = MiningEngine::with_parts(
            catalog,
            store,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Box::new(StepRng::new(0, 0)),
            1_000,
        );
        (engine, clock)
    }

    #[test]
    fn test_commands_create_players_on_demand() {
        let (engine, _) = engine();
        let stats = engine.view_stats(77).unwrap();
        assert_eq!(stats.currency, 0);
        assert_eq!(stats.level, 1);
        assert_eq!(stats.mine_name, "starter mine");
        assert_eq!(stats.gear.as_ref().map(ItemKey::as_str), Some("wooden_pickaxe"));
        assert!(stats.session_start.is_none());
    }

    #[test]
    fn test_session_elapsed_in_snapshot() {
        let (engine, clock) = engine();
        engine.start_session(1).unwrap();
        clock.advance(Duration::from_secs(90));
        assert_eq!(engine.view_stats(1).unwrap().session_elapsed, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_retry_recovers_from_single_failure() {
        let (engine, _) = engine();
        engine.view_stats(1).unwrap();

        engine.store().fail_next_commits(1);
        engine.start_session(1).unwrap();
        assert!(engine.view_stats(1).unwrap().session_start.is_some());
    }

    #[test]
    fn test_persistent_failure_surfaces_without_partial_effect() {
        let (engine, clock) = engine();
        engine.start_session(1).unwrap();
        clock.advance(Duration::from_secs(120));

        engine.store().fail_next_commits(2);
        let result = engine.close_session(1);
        assert!(matches!(result, Err(EconomyError::StorageUnavailable(_))));

        let stats = engine.view_stats(1).unwrap();
        assert!(stats.session_start.is_some());
        assert_eq!(stats.inventory.count("coal"), 0);

        let report = engine.close_session(1).unwrap();
        assert_eq!(report.drops.get("coal"), Some(&4));
    }

    #[test]
    fn test_player_errors_are_not_retried() {
        let (engine, _) = engine();
        engine.view_stats(1).unwrap();
        engine.store().fail_next_commits(1);

        // A player error never reaches the store, so the armed failure is
        // still there for the next write.
        assert_eq!(engine.close_session(1), Err(EconomyError::NoActiveSession(1)));
        assert!(engine.start_session(1).is_ok());
    }
}
