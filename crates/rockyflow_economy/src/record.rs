//! # Player Records
//!
//! One durable record per player id. Records are mutated only through the
//! [`RecordStore`](crate::store::RecordStore), which serializes them as JSON
//! into the write-ahead log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::StarterKit;
use crate::error::{EconomyError, EconomyResult};
use crate::inventory::Inventory;
use crate::keys::MineKey;

/// Stable external player identifier (the chat platform's user id).
pub type PlayerId = u64;

/// Everything persisted about a player.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    /// Primary key.
    pub player_id: PlayerId,
    /// Ores, processed goods and gear.
    pub inventory: Inventory,
    /// Total experience earned. Never decreases.
    pub experience: u64,
    /// Coin balance.
    pub currency: u64,
    /// Mine whose loot table is used when the session closes.
    pub current_mine: MineKey,
    /// Start of the open mining session, if any.
    pub session_start: Option<DateTime<Utc>>,
}

impl PlayerRecord {
    /// A freshly created player: starter gear, starter balance, starter mine,
    /// no session.
    #[must_use]
    pub fn new(player_id: PlayerId, starter: &StarterKit) -> Self {
        Self {
            player_id,
            inventory: starter.inventory(),
            experience: 0,
            currency: starter.currency,
            current_mine: starter.mine.clone(),
            session_start: None,
        }
    }

    /// True while a mining session is open.
    #[inline]
    #[must_use]
    pub fn has_active_session(&self) -> bool {
        self.session_start.is_some()
    }

    /// Display level derived from experience: `floor(sqrt(xp / 100)) + 1`.
    #[must_use]
    pub fn level(&self) -> u32 {
        let steps = self.experience / 100;
        // Integer square root; f64 is exact for every u64 below 2^52 and
        // the correction loops handle the rest.
        let mut root = (steps as f64).sqrt() as u64;
        while root.saturating_mul(root) > steps {
            root -= 1;
        }
        while (root + 1).saturating_mul(root + 1) <= steps {
            root += 1;
        }
        u32::try_from(root).unwrap_or(u32::MAX).saturating_add(1)
    }

    /// Encodes the record in the persisted layout.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::StorageUnavailable` if encoding fails.
    pub fn to_json(&self) -> EconomyResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            EconomyError::StorageUnavailable(format!("failed to encode record for player {}: {e}", self.player_id))
        })
    }

    /// Decodes a record from the persisted layout.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::CorruptStorage` if the bytes are not a record.
    pub fn from_json(bytes: &[u8]) -> EconomyResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| EconomyError::CorruptStorage(format!("failed to decode player record: {e}")))
    }
}

/// A set of field overwrites merged into a record in one atomic step.
///
/// `None` leaves a field as it is. `session_start` is doubly optional so an
/// update can clear the session (`Some(None)`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlayerUpdate {
    /// New inventory.
    pub inventory: Option<Inventory>,
    /// New experience total.
    pub experience: Option<u64>,
    /// New balance.
    pub currency: Option<u64>,
    /// New current mine.
    pub current_mine: Option<MineKey>,
    /// New session start (`Some(None)` clears it).
    pub session_start: Option<Option<DateTime<Utc>>>,
}

impl PlayerUpdate {
    /// An update that changes nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the inventory.
    #[must_use]
    pub fn inventory(mut self, inventory: Inventory) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Sets the experience total.
    #[must_use]
    pub fn experience(mut self, experience: u64) -> Self {
        self.experience = Some(experience);
        self
    }

    /// Sets the balance.
    #[must_use]
    pub fn currency(mut self, currency: u64) -> Self {
        self.currency = Some(currency);
        self
    }

    /// Sets the current mine.
    #[must_use]
    pub fn current_mine(mut self, mine: MineKey) -> Self {
        self.current_mine = Some(mine);
        self
    }

    /// Opens (`Some`) or clears (`None`) the session.
    #[must_use]
    pub fn session_start(mut self, start: Option<DateTime<Utc>>) -> Self {
        self.session_start = Some(start);
        self
    }

    /// Merges the update into `record`.
    pub fn apply_to(self, record: &mut PlayerRecord) {
        if let Some(inventory) = self.inventory {
            record.inventory = inventory;
        }
        if let Some(experience) = self.experience {
            record.experience = experience;
        }
        if let Some(currency) = self.currency {
            record.currency = currency;
        }
        if let Some(mine) = self.current_mine {
            record.current_mine = mine;
        }
        if let Some(start) = self.session_start {
            record.session_start = start;
        }
    }
}
