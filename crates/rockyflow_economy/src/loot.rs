//! # Loot Resolver
//!
//! **Time-Budgeted Weighted Drops**
//!
//! Converts the length of a mining session into item drops and experience.
//!
//! ## Algorithm
//!
//! The elapsed session time is a budget in milliseconds. Each draw picks an
//! ore from the mine's weighted table and, if the player's gear can mine it,
//! credits one unit of the ore's item plus its xp and spends the ore's cost
//! for that gear. Draws continue while budget remains.
//!
//! Table rows are walked in catalog declaration order, so a fixed random
//! source always reproduces the same outcome.
//!
//! ## Termination
//!
//! An ore the gear cannot mine yields nothing and spends nothing. If no ore
//! in the mine is mineable the resolver stops before drawing. Otherwise the
//! number of draws is capped; hitting the cap ends the session's loot with
//! `exhausted` set.

use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::Catalog;
use crate::error::{EconomyError, EconomyResult};
use crate::inventory::{Inventory, ItemCounts};
use crate::keys::ItemKey;

/// Default cap on draws per resolution.
pub const DEFAULT_MAX_DRAWS: u64 = 1_000_000;

/// Result of resolving one session's loot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LootOutcome {
    /// Units dropped per item.
    pub drops: ItemCounts,
    /// Experience earned.
    pub xp_total: u64,
    /// Random draws performed.
    pub draws: u64,
    /// True if the draw cap ended resolution before the budget ran out.
    pub exhausted: bool,
    /// Gear tier the drops were resolved with.
    pub gear: Option<ItemKey>,
}

impl LootOutcome {
    /// Total number of units dropped.
    #[must_use]
    pub fn total_drops(&self) -> u64 {
        self.drops.values().sum()
    }
}

/// A table row resolved against the player's gear.
struct Row<'a> {
    /// Cumulative normalized weight up to and including this row.
    upper: f64,
    weight: f64,
    item: &'a ItemKey,
    xp: u64,
    cost_ms: u64,
}

/// Resolves session loot against an immutable catalog.
#[derive(Clone, Debug)]
pub struct LootResolver {
    catalog: Arc<Catalog>,
    max_draws: u64,
}

impl LootResolver {
    /// Creates a resolver with the given draw cap.
    #[must_use]
    pub fn new(catalog: Arc<Catalog>, max_draws: u64) -> Self {
        Self { catalog, max_draws }
    }

    /// Resolves the drops for `elapsed` time spent in `mine` by a player
    /// holding `inventory`.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::UnknownMine` if the mine is not in the catalog,
    /// or `EconomyError::ArithmeticOverflow` if the xp total would wrap.
    pub fn resolve<R: Rng + ?Sized>(
        &self,
        elapsed: Duration,
        mine: &str,
        inventory: &Inventory,
        rng: &mut R,
    ) -> EconomyResult<LootOutcome> {
        let mine_def = self
            .catalog
            .mine(mine)
            .ok_or_else(|| EconomyError::UnknownMine(mine.to_string()))?;
        let gear = self.catalog.effective_gear(inventory);

        let mut outcome = LootOutcome {
            gear: gear.cloned(),
            ..LootOutcome::default()
        };

        let mut upper = 0.0;
        let rows: Vec<Row<'_>> = mine_def
            .table
            .iter()
            .filter_map(|entry| {
                let ore = self.catalog.ore(entry.ore.as_str())?;
                upper += entry.weight;
                Some(Row {
                    upper,
                    weight: entry.weight,
                    item: &ore.item,
                    xp: ore.xp,
                    cost_ms: u64::from(ore.cost_for(gear)) * 1000,
                })
            })
            .collect();

        if !rows.iter().any(|row| row.weight > 0.0 && row.cost_ms > 0) {
            tracing::debug!(mine, gear = ?outcome.gear, "nothing in this mine is mineable with current gear");
            return Ok(outcome);
        }

        let mut remaining = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        while remaining > 0 {
            if outcome.draws >= self.max_draws {
                outcome.exhausted = true;
                tracing::warn!(
                    mine,
                    draws = outcome.draws,
                    remaining_ms = remaining,
                    "loot draw cap reached, no further drops this session"
                );
                break;
            }
            outcome.draws += 1;

            let roll: f64 = rng.gen();
            let Some(row) = Self::select(&rows, roll) else {
                break;
            };
            if row.cost_ms == 0 {
                continue;
            }

            *outcome.drops.entry(row.item.clone()).or_insert(0) += 1;
            outcome.xp_total = outcome.xp_total.checked_add(row.xp).ok_or(EconomyError::ArithmeticOverflow)?;
            remaining = remaining.saturating_sub(row.cost_ms);
        }

        tracing::debug!(
            mine,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            draws = outcome.draws,
            drops = outcome.total_drops(),
            xp = outcome.xp_total,
            "loot resolved"
        );
        Ok(outcome)
    }

    /// First row whose cumulative range contains `roll`. Rounding can leave
    /// the last upper bound a hair under 1.0; such rolls land on the last row.
    fn select<'r, 'a>(rows: &'r [Row<'a>], roll: f64) -> Option<&'r Row<'a>> {
        rows.iter().find(|row| roll < row.upper).or_else(|| rows.last())
    }

    /// Resolves `sessions` sessions of `elapsed` each and aggregates the
    /// results, for balance tuning.
    ///
    /// # Errors
    ///
    /// Same as [`resolve`](Self::resolve).
    pub fn run_statistics<R: Rng + ?Sized>(
        &self,
        mine: &str,
        inventory: &Inventory,
        elapsed: Duration,
        sessions: u32,
        rng: &mut R,
    ) -> EconomyResult<LootStatistics> {
        let mut stats = LootStatistics::new();
        for _ in 0..sessions {
            let outcome = self.resolve(elapsed, mine, inventory, rng)?;
            stats.sessions += 1;
            stats.total_draws += outcome.draws;
            stats.total_xp = stats.total_xp.saturating_add(outcome.xp_total);
            if outcome.exhausted {
                stats.exhausted_sessions += 1;
            }
            for (item, count) in outcome.drops {
                let slot = stats.item_counts.entry(item).or_insert(0);
                *slot = slot.saturating_add(count);
            }
        }
        tracing::debug!(mine, sessions = stats.sessions, xp = stats.total_xp, "loot statistics collected");
        Ok(stats)
    }
}

/// Aggregated results of repeated loot resolution.
#[derive(Clone, Debug, Default)]
pub struct LootStatistics {
    /// Sessions simulated.
    pub sessions: u64,
    /// Draws across all sessions.
    pub total_draws: u64,
    /// Experience across all sessions.
    pub total_xp: u64,
    /// Sessions that hit the draw cap.
    pub exhausted_sessions: u64,
    /// Units dropped per item across all sessions.
    pub item_counts: BTreeMap<ItemKey, u64>,
}

impl LootStatistics {
    /// Creates empty statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of all dropped units that were `item`, as a percentage.
    #[must_use]
    pub fn item_share_percent(&self, item: &str) -> f64 {
        let total: u64 = self.item_counts.values().sum();
        if total == 0 {
            0.0
        } else {
            (self.item_counts.get(item).copied().unwrap_or(0) as f64 / total as f64) * 100.0
        }
    }

    /// Mean experience per session.
    #[must_use]
    pub fn xp_per_session(&self) -> f64 {
        if self.sessions == 0 {
            0.0
        } else {
            self.total_xp as f64 / self.sessions as f64
        }
    }
}
