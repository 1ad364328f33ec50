//! # Session Manager
//!
//! Mining sessions move a player between two states:
//!
//! ```text
//! Idle ──start_session──> Active ──close_session──> Idle
//! ```
//!
//! Nothing runs while a session is open. Progress is computed when the
//! session closes, from the time between start and close.
//!
//! Closing credits the rewards and clears the session start in the same
//! store transaction. A second close (or a concurrent one that lost the race
//! for the player lock) sees an idle player and fails with
//! `NoActiveSession`, so rewards are granted exactly once.
//!
//! Each close draws its loot from its own `ChaCha8Rng`, seeded with one
//! value taken from the shared seed source. The source is locked only for
//! that value, never for the resolution itself.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::Catalog;
use crate::error::{EconomyError, EconomyResult};
use crate::inventory::ItemCounts;
use crate::keys::{ItemKey, MineKey};
use crate::ledger::EconomyLedger;
use crate::loot::LootResolver;
use crate::record::{PlayerId, PlayerRecord};
use crate::store::RecordStore;

// ============================================================================
// Clock
// ============================================================================

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock stopped at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    /// Moves the clock to `time`, which may be in the past.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.now.lock() = time;
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        if let Some(next) = chrono::Duration::from_std(by).ok().and_then(|by| now.checked_add_signed(by)) {
            *now = next;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ============================================================================
// Results
// ============================================================================

/// State reported when a session opens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStart {
    /// Player.
    pub player_id: PlayerId,
    /// Recorded start time.
    pub started_at: DateTime<Utc>,
    /// Strongest gear held.
    pub gear: Option<ItemKey>,
    /// Mine the session runs in.
    pub mine: MineKey,
    /// Display name of the mine.
    pub mine_name: String,
    /// Balance at start.
    pub currency: u64,
    /// Experience at start.
    pub experience: u64,
}

/// Rewards reported when a session closes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    /// Player.
    pub player_id: PlayerId,
    /// When the session started.
    pub started_at: DateTime<Utc>,
    /// When it was closed.
    pub ended_at: DateTime<Utc>,
    /// Time credited to the session (never negative).
    pub duration: Duration,
    /// Mine the loot came from.
    pub mine: MineKey,
    /// Units credited per item.
    pub drops: ItemCounts,
    /// Experience credited.
    pub xp_gained: u64,
    /// Balance after the credit.
    pub currency: u64,
    /// Experience after the credit.
    pub experience: u64,
    /// The draw cap cut the loot short.
    pub exhausted: bool,
}

/// Result of moving to another mine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TravelReceipt {
    /// Mine left.
    pub from: MineKey,
    /// Mine entered.
    pub to: MineKey,
    /// Display name of the new mine.
    pub name: String,
}

/// A mine as seen by one player.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MineListing {
    /// Mine key.
    pub mine: MineKey,
    /// Display name.
    pub name: String,
    /// Experience needed to enter.
    pub required_xp: u64,
    /// The player has enough experience.
    pub unlocked: bool,
    /// The player is here now.
    pub current: bool,
}

// ============================================================================
// Session manager
// ============================================================================

/// Opens and closes mining sessions and moves players between mines.
pub struct SessionManager {
    catalog: Arc<Catalog>,
    store: Arc<RecordStore>,
    resolver: LootResolver,
    clock: Arc<dyn Clock>,
    seeds: Mutex<Box<dyn RngCore + Send>>,
}

impl SessionManager {
    /// Creates a session manager. `seeds` supplies one seed per closed
    /// session.
    #[must_use]
    pub fn new(
        catalog: Arc<Catalog>,
        store: Arc<RecordStore>,
        resolver: LootResolver,
        clock: Arc<dyn Clock>,
        seeds: Box<dyn RngCore + Send>,
    ) -> Self {
        Self {
            catalog,
            store,
            resolver,
            clock,
            seeds: Mutex::new(seeds),
        }
    }

    /// Opens a session at the current time.
    ///
    /// # Errors
    ///
    /// `SessionAlreadyActive`, `NotFound` or `StorageUnavailable`.
    pub fn start_session(&self, player_id: PlayerId) -> EconomyResult<SessionStart> {
        let start = self.store.transact(player_id, |record| {
            if record.has_active_session() {
                return Err(EconomyError::SessionAlreadyActive(player_id));
            }
            self.repair_mine(record);

            let now = self.clock.now();
            record.session_start = Some(now);
            Ok(SessionStart {
                player_id,
                started_at: now,
                gear: self.catalog.effective_gear(&record.inventory).cloned(),
                mine_name: self.mine_name(&record.current_mine),
                mine: record.current_mine.clone(),
                currency: record.currency,
                experience: record.experience,
            })
        })?;

        tracing::info!(player_id, mine = %start.mine, gear = ?start.gear, "session started");
        Ok(start)
    }

    /// Closes the open session, resolves its loot and credits it.
    ///
    /// Rewards are credited and the session cleared in one transaction.
    ///
    /// # Errors
    ///
    /// `NoActiveSession`, `NotFound`, `ArithmeticOverflow` or
    /// `StorageUnavailable`. On error nothing is credited and the session
    /// stays open.
    pub fn close_session(&self, player_id: PlayerId) -> EconomyResult<SessionReport> {
        let mut rng = self.session_rng();
        let report = self.store.transact(player_id, |record| {
            let started_at = record.session_start.ok_or(EconomyError::NoActiveSession(player_id))?;
            let ended_at = self.clock.now();
            let duration = (ended_at - started_at).to_std().unwrap_or_else(|_| {
                tracing::warn!(
                    player_id,
                    %started_at,
                    %ended_at,
                    "session start is in the future, crediting zero time"
                );
                Duration::ZERO
            });
            self.repair_mine(record);

            let outcome = self
                .resolver
                .resolve(duration, record.current_mine.as_str(), &record.inventory, &mut rng)?;

            EconomyLedger::apply_rewards(record, &outcome.drops, outcome.xp_total)?;
            record.session_start = None;

            Ok(SessionReport {
                player_id,
                started_at,
                ended_at,
                duration,
                mine: record.current_mine.clone(),
                drops: outcome.drops,
                xp_gained: outcome.xp_total,
                currency: record.currency,
                experience: record.experience,
                exhausted: outcome.exhausted,
            })
        })?;

        tracing::info!(
            player_id,
            mine = %report.mine,
            duration_secs = report.duration.as_secs(),
            drops = report.drops.values().sum::<u64>(),
            xp = report.xp_gained,
            "session closed"
        );
        Ok(report)
    }

    /// Moves the player to another mine.
    ///
    /// # Errors
    ///
    /// - `UnknownMine` if the mine does not exist
    /// - `SessionInProgress` while a session is open
    /// - `MineLocked` if the player's experience is below the requirement
    pub fn travel(&self, player_id: PlayerId, mine: &str) -> EconomyResult<TravelReceipt> {
        let target = self
            .catalog
            .mine(mine)
            .ok_or_else(|| EconomyError::UnknownMine(mine.to_string()))?;

        let receipt = self.store.transact(player_id, |record| {
            if record.has_active_session() {
                return Err(EconomyError::SessionInProgress(player_id));
            }
            if record.experience < target.required_xp {
                return Err(EconomyError::MineLocked {
                    mine: mine.to_string(),
                    required: target.required_xp,
                    current: record.experience,
                });
            }
            let from = std::mem::replace(&mut record.current_mine, target.key.clone());
            Ok(TravelReceipt {
                from,
                to: target.key.clone(),
                name: target.name.clone(),
            })
        })?;

        tracing::info!(player_id, from = %receipt.from, to = %receipt.to, "player travelled");
        Ok(receipt)
    }

    /// Every mine with the player's access to it.
    ///
    /// # Errors
    ///
    /// `NotFound` or `StorageUnavailable`.
    pub fn list_mines(&self, player_id: PlayerId) -> EconomyResult<Vec<MineListing>> {
        let record = self.store.get(player_id)?;
        let mut mines: Vec<_> = self
            .catalog
            .mines()
            .map(|mine| MineListing {
                mine: mine.key.clone(),
                name: mine.name.clone(),
                required_xp: mine.required_xp,
                unlocked: record.experience >= mine.required_xp,
                current: mine.key == record.current_mine,
            })
            .collect();
        mines.sort_by(|a, b| a.required_xp.cmp(&b.required_xp).then_with(|| a.mine.cmp(&b.mine)));
        Ok(mines)
    }

    fn session_rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seeds.lock().next_u64())
    }

    /// Sends a player whose mine no longer exists back to the starter mine.
    fn repair_mine(&self, record: &mut PlayerRecord) {
        if self.catalog.mine(record.current_mine.as_str()).is_none() {
            let starter = self.catalog.starter().mine.clone();
            tracing::warn!(
                player_id = record.player_id,
                mine = %record.current_mine,
                fallback = %starter,
                "unknown current mine, returning player to the starter mine"
            );
            record.current_mine = starter;
        }
    }

    fn mine_name(&self, mine: &MineKey) -> String {
        self.catalog
            .mine(mine.as_str())
            .map_or_else(|| mine.to_string(), |m| m.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::test_catalog;
    use crate::loot::DEFAULT_MAX_DRAWS;
    use crate::record::PlayerUpdate;
    use chrono::TimeZone;
    use rand::rngs::mock::StepRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Seed source that counts how often it is read.
    struct CountingSeeds {
        inner: StepRng,
        reads: Arc<AtomicU32>,
    }

    impl RngCore for CountingSeeds {
        fn next_u32(&mut self) -> u32 {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.next_u32()
        }

        fn next_u64(&mut self) -> u64 {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.next_u64()
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.fill_bytes(dest);
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    struct Fixture {
        sessions: SessionManager,
        store: Arc<RecordStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        fixture_with(Box::new(StepRng::new(0, 0)))
    }

    fn fixture_with(seeds: Box<dyn RngCore + Send>) -> Fixture {
        let catalog = Arc::new(test_catalog());
        let store = Arc::new(RecordStore::in_memory(catalog.starter().clone(), Duration::from_millis(200)));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap()));
        let resolver = LootResolver::new(Arc::clone(&catalog), DEFAULT_MAX_DRAWS);
        let sessions = SessionManager::new(
            catalog,
            Arc::clone(&store),
            resolver,
            Arc::clone(&clock) as Arc<dyn Clock>,
            seeds,
        );
        Fixture { sessions, store, clock }
    }

    #[test]
    fn test_start_then_close_credits_loot() {
        let f = fixture();
        f.store.ensure_exists(1).unwrap();

        let start = f.sessions.start_session(1).unwrap();
        assert_eq!(start.mine.as_str(), "starter_mine");
        assert_eq!(start.mine_name, "starter mine");
        assert_eq!(start.gear.as_ref().map(ItemKey::as_str), Some("wooden_pickaxe"));

        f.clock.advance(Duration::from_secs(600));
        let report = f.sessions.close_session(1).unwrap();
        assert_eq!(report.duration, Duration::from_secs(600));
        assert_eq!(report.drops.get("coal"), Some(&20));
        assert_eq!(report.xp_gained, 40);
        assert_eq!(report.experience, 40);

        let record = f.store.get(1).unwrap();
        assert_eq!(record.inventory.count("coal"), 20);
        assert!(!record.has_active_session());
    }

    #[test]
    fn test_double_start_rejected() {
        let f = fixture();
        f.store.ensure_exists(1).unwrap();
        f.sessions.start_session(1).unwrap();
        assert_eq!(f.sessions.start_session(1), Err(EconomyError::SessionAlreadyActive(1)));
    }

    #[test]
    fn test_second_close_grants_nothing() {
        let f = fixture();
        f.store.ensure_exists(1).unwrap();
        f.sessions.start_session(1).unwrap();
        f.clock.advance(Duration::from_secs(300));

        f.sessions.close_session(1).unwrap();
        let after_first = f.store.get(1).unwrap();
        assert_eq!(f.sessions.close_session(1), Err(EconomyError::NoActiveSession(1)));
        assert_eq!(f.store.get(1).unwrap(), after_first);
    }

    #[test]
    fn test_close_without_start() {
        let f = fixture();
        f.store.ensure_exists(1).unwrap();
        assert_eq!(f.sessions.close_session(1), Err(EconomyError::NoActiveSession(1)));
    }

    #[test]
    fn test_clock_skew_credits_zero_time() {
        let f = fixture();
        f.store.ensure_exists(1).unwrap();
        f.sessions.start_session(1).unwrap();
        f.clock.set(Utc.with_ymd_and_hms(2026, 4, 30, 9, 0, 0).unwrap());

        let report = f.sessions.close_session(1).unwrap();
        assert_eq!(report.duration, Duration::ZERO);
        assert!(report.drops.is_empty());
        assert!(!f.store.get(1).unwrap().has_active_session());
    }

    #[test]
    fn test_failed_commit_keeps_session_open() {
        let f = fixture();
        f.store.ensure_exists(1).unwrap();
        f.sessions.start_session(1).unwrap();
        f.clock.advance(Duration::from_secs(60));

        f.store.fail_next_commits(1);
        assert!(matches!(f.sessions.close_session(1), Err(EconomyError::StorageUnavailable(_))));
        let record = f.store.get(1).unwrap();
        assert!(record.has_active_session());
        assert_eq!(record.inventory.count("coal"), 0);

        assert_eq!(f.sessions.close_session(1).unwrap().drops.get("coal"), Some(&2));
    }

    #[test]
    fn test_travel_rules() {
        let f = fixture();
        f.store.ensure_exists(1).unwrap();

        assert_eq!(
            f.sessions.travel(1, "deep_mine"),
            Err(EconomyError::MineLocked { mine: "deep_mine".into(), required: 100, current: 0 })
        );
        assert_eq!(f.sessions.travel(1, "moon"), Err(EconomyError::UnknownMine("moon".into())));

        f.store.apply(1, PlayerUpdate::new().experience(100)).unwrap();
        f.sessions.start_session(1).unwrap();
        assert_eq!(f.sessions.travel(1, "deep_mine"), Err(EconomyError::SessionInProgress(1)));
        f.sessions.close_session(1).unwrap();

        let receipt = f.sessions.travel(1, "deep_mine").unwrap();
        assert_eq!(receipt.from.as_str(), "starter_mine");
        assert_eq!(f.store.get(1).unwrap().current_mine.as_str(), "deep_mine");
    }

    #[test]
    fn test_list_mines() {
        let f = fixture();
        f.store.ensure_exists(1).unwrap();
        let mines = f.sessions.list_mines(1).unwrap();
        assert_eq!(mines.len(), 2);
        assert_eq!(mines[0].mine.as_str(), "starter_mine");
        assert!(mines[0].unlocked && mines[0].current);
        assert!(!mines[1].unlocked && !mines[1].current);
    }

    #[test]
    fn test_removed_mine_falls_back_to_starter() {
        let f = fixture();
        f.store.apply(1, PlayerUpdate::new().current_mine(MineKey::new("flooded_mine"))).unwrap();
        let start = f.sessions.start_session(1).unwrap();
        assert_eq!(start.mine.as_str(), "starter_mine");
    }

    #[test]
    fn test_close_reads_one_seed_per_session() {
        let reads = Arc::new(AtomicU32::new(0));
        let f = fixture_with(Box::new(CountingSeeds {
            inner: StepRng::new(0, 0),
            reads: Arc::clone(&reads),
        }));
        f.store.ensure_exists(1).unwrap();

        f.sessions.start_session(1).unwrap();
        f.clock.advance(Duration::from_secs(600));
        let report = f.sessions.close_session(1).unwrap();
        assert_eq!(report.drops.get("coal"), Some(&20));
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        f.sessions.start_session(1).unwrap();
        f.clock.advance(Duration::from_secs(600));
        f.sessions.close_session(1).unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_seeded_sessions_are_reproducible() {
        let run = || {
            let f = fixture_with(Box::new(ChaCha8Rng::seed_from_u64(9)));
            let stone: crate::inventory::Inventory = [(ItemKey::new("stone_pickaxe"), 1)].into_iter().collect();
            f.store.apply(1, PlayerUpdate::new().inventory(stone)).unwrap();
            (0..3)
                .map(|_| {
                    f.sessions.start_session(1).unwrap();
                    f.clock.advance(Duration::from_secs(3_600));
                    f.sessions.close_session(1).unwrap().drops
                })
                .collect::<Vec<_>>()
        };

        let first = run();
        assert_eq!(first, run());
        assert!(first.iter().all(|drops| drops.contains_key("coal") && drops.contains_key("iron")));
    }
}
