//! # Rockyflow Economy
//!
//! Session, loot and ledger logic for the Rockyflow mining game.
//!
//! ## Design Principles
//!
//! 1. **Integer money** - balances, prices and counts are `u64` with checked arithmetic
//! 2. **Time is the budget** - a closed session's length pays for weighted drops
//! 3. **Transactional updates** - every player mutation is all-or-nothing and logged before it is visible
//! 4. **External configuration** - all balance data lives in a TOML catalog
//!
//! ## Thread Safety
//!
//! [`MiningEngine`] is `Send + Sync`. Commands for one player are serialized
//! on that player's record lock; different players run in parallel.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rockyflow_economy::{EngineConfig, MiningEngine};
//!
//! let config = EngineConfig::load("data/rockyflow.toml")?;
//! let engine = MiningEngine::open(&config)?;
//!
//! engine.start_session(player_id)?;
//! let report = engine.close_session(player_id)?;
//! engine.sell_all(player_id)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod catalog;
pub mod config;
pub mod crafting;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod keys;
pub mod ledger;
pub mod loot;
pub mod record;
pub mod session;
pub mod store;
pub mod wal;

pub use catalog::{Catalog, ItemDef, Mine, MineOre, Ore, StarterKit};
pub use config::EngineConfig;
pub use crafting::{ProcessOutput, Recipe, RecipeBook};
pub use engine::{MiningEngine, PlayerSnapshot};
pub use error::{EconomyError, EconomyResult};
pub use inventory::{Inventory, ItemCounts};
pub use keys::{ItemKey, MineKey, OreKey, RecipeKey};
pub use ledger::{
    EconomyLedger, ProcessReceipt, PurchaseReceipt, RecipeListing, SaleReceipt, SellableListing, ShopListing,
    SoldLine,
};
pub use loot::{LootOutcome, LootResolver, LootStatistics, DEFAULT_MAX_DRAWS};
pub use record::{PlayerId, PlayerRecord, PlayerUpdate};
pub use session::{
    Clock, ManualClock, MineListing, SessionManager, SessionReport, SessionStart, SystemClock, TravelReceipt,
};
pub use store::{RecordStore, DEFAULT_COMPACT_THRESHOLD};
pub use wal::{WalOperation, WriteAheadLog};
