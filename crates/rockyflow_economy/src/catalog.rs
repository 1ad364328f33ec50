//! # Progression Catalog
//!
//! Static balance data: gear tiers, items, ores, mines, the gear shop and
//! processing recipes. Loaded once at startup from TOML, validated, then
//! shared read-only (`Arc<Catalog>`) by the loot resolver and the ledger.
//!
//! ## Document layout
//!
//! ```toml
//! gear_tiers = ["wooden_pickaxe", "stone_pickaxe"]   # weakest -> strongest
//!
//! [starter]
//! mine = "starter_mine"
//! gear = ["wooden_pickaxe"]
//!
//! [items.coal]
//! name = "coal"
//! sell_price = 1
//!
//! [ores.coal_ore]
//! item = "coal"
//! xp = 2
//! cost = { wooden_pickaxe = 45, stone_pickaxe = 30 }   # seconds per drop
//!
//! [mines.starter_mine]
//! name = "starter mine"
//! ores = [{ ore = "coal_ore", weight = 1.0 }]          # declaration order is kept
//!
//! [gear_shop]
//! stone_pickaxe = 50
//!
//! [recipes.iron_ingot]
//! inputs = { iron = 3, coal = 1 }
//! outputs = { iron_ingot = 1 }
//! xp = 8
//! ```
//!
//! Every cross reference is checked at load time. A catalog that loads is
//! internally consistent, so lookups by a key taken from the catalog itself
//! never fail.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::crafting::{Recipe, RecipeBook};
use crate::error::{EconomyError, EconomyResult};
use crate::inventory::{Inventory, ItemCounts};
use crate::keys::{ItemKey, MineKey, OreKey, RecipeKey};

// ============================================================================
// Raw document (as written in TOML)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogDocument {
    gear_tiers: Vec<ItemKey>,
    starter: StarterDocument,
    items: BTreeMap<ItemKey, ItemDef>,
    ores: BTreeMap<OreKey, OreDocument>,
    mines: BTreeMap<MineKey, MineDocument>,
    #[serde(default)]
    gear_shop: BTreeMap<ItemKey, u64>,
    #[serde(default)]
    recipes: BTreeMap<RecipeKey, RecipeDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StarterDocument {
    mine: MineKey,
    #[serde(default)]
    gear: Vec<ItemKey>,
    #[serde(default)]
    currency: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OreDocument {
    item: ItemKey,
    xp: u64,
    #[serde(default)]
    cost: BTreeMap<ItemKey, u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MineDocument {
    name: Option<String>,
    #[serde(default)]
    required_xp: u64,
    ores: Vec<MineOreDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MineOreDocument {
    ore: OreKey,
    weight: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeDocument {
    name: Option<String>,
    inputs: ItemCounts,
    outputs: ItemCounts,
    #[serde(default)]
    xp: u64,
}

// ============================================================================
// Validated catalog
// ============================================================================

/// Display data and sell price of an item.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemDef {
    /// Human-readable name.
    pub name: String,
    /// Emoji or short glyph shown next to the name.
    #[serde(default)]
    pub emoji: String,
    /// Price paid per unit when sold; `None` means the item is not sellable.
    #[serde(default)]
    pub sell_price: Option<u64>,
}

/// What a new player starts with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StarterKit {
    /// Mine a new player is placed in.
    pub mine: MineKey,
    /// Gear granted on creation (one of each).
    pub gear: Vec<ItemKey>,
    /// Opening balance.
    pub currency: u64,
}

impl StarterKit {
    /// The inventory a new player is created with.
    #[must_use]
    pub fn inventory(&self) -> Inventory {
        self.gear.iter().map(|gear| (gear.clone(), 1)).collect()
    }
}

/// A mineable ore.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ore {
    /// Ore key.
    pub key: OreKey,
    /// Item credited per drop.
    pub item: ItemKey,
    /// Experience per drop.
    pub xp: u64,
    /// Seconds consumed per drop, by gear tier. Missing tiers cannot mine it.
    cost: BTreeMap<ItemKey, u32>,
}

impl Ore {
    /// Seconds of session time consumed per drop with `gear`.
    ///
    /// Zero means the ore cannot be mined with that gear (or with no gear).
    #[must_use]
    pub fn cost_for(&self, gear: Option<&ItemKey>) -> u32 {
        gear.and_then(|g| self.cost.get(g)).copied().unwrap_or(0)
    }
}

/// One row of a mine's probability table.
#[derive(Clone, Debug, PartialEq)]
pub struct MineOre {
    /// Ore selected by this row.
    pub ore: OreKey,
    /// Normalized probability; all rows of a mine sum to 1.0.
    pub weight: f64,
}

/// A mine location.
#[derive(Clone, Debug, PartialEq)]
pub struct Mine {
    /// Mine key.
    pub key: MineKey,
    /// Human-readable name.
    pub name: String,
    /// Experience needed to travel here.
    pub required_xp: u64,
    /// Probability table in declaration order.
    pub table: Vec<MineOre>,
}

/// The validated, immutable progression catalog.
#[derive(Clone, Debug)]
pub struct Catalog {
    gear_tiers: Vec<ItemKey>,
    starter: StarterKit,
    items: BTreeMap<ItemKey, ItemDef>,
    ores: BTreeMap<OreKey, Ore>,
    mines: BTreeMap<MineKey, Mine>,
    gear_shop: BTreeMap<ItemKey, u64>,
    recipes: RecipeBook,
}

impl Catalog {
    /// Loads and validates a catalog file.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::CatalogLoad` if the file cannot be read, is not
    /// valid TOML, or fails validation.
    pub fn load(path: impl AsRef<Path>) -> EconomyResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EconomyError::CatalogLoad(format!("failed to read {}: {e}", path.display())))?;
        let catalog = Self::from_toml_str(&text)?;
        tracing::info!(
            path = %path.display(),
            items = catalog.items.len(),
            ores = catalog.ores.len(),
            mines = catalog.mines.len(),
            recipes = catalog.recipes.len(),
            "catalog loaded"
        );
        Ok(catalog)
    }

    /// Parses and validates a catalog from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::CatalogLoad` describing the first problem found.
    pub fn from_toml_str(text: &str) -> EconomyResult<Self> {
        let doc: CatalogDocument =
            toml::from_str(text).map_err(|e| EconomyError::CatalogLoad(e.to_string()))?;
        Self::from_document(doc)
    }

    fn from_document(doc: CatalogDocument) -> EconomyResult<Self> {
        let items = doc.items;
        let require_item = |item: &ItemKey, context: &str| {
            if items.contains_key(item) {
                Ok(())
            } else {
                Err(EconomyError::CatalogLoad(format!("{context} references unknown item {item}")))
            }
        };

        // Gear tiers
        let mut seen = BTreeSet::new();
        for gear in &doc.gear_tiers {
            require_item(gear, "gear_tiers")?;
            if !seen.insert(gear) {
                return Err(EconomyError::CatalogLoad(format!("gear tier {gear} listed twice")));
            }
        }
        let is_gear = |item: &ItemKey| doc.gear_tiers.contains(item);

        // Ores
        let mut ores = BTreeMap::new();
        for (key, ore) in doc.ores {
            require_item(&ore.item, &format!("ore {key}"))?;
            if let Some(gear) = ore.cost.keys().find(|gear| !is_gear(gear)) {
                return Err(EconomyError::CatalogLoad(format!(
                    "ore {key} has a cost for {gear}, which is not a gear tier"
                )));
            }
            ores.insert(
                key.clone(),
                Ore {
                    key,
                    item: ore.item,
                    xp: ore.xp,
                    cost: ore.cost,
                },
            );
        }

        // Mines
        let mut mines = BTreeMap::new();
        for (key, mine) in doc.mines {
            if mine.ores.is_empty() {
                return Err(EconomyError::CatalogLoad(format!("mine {key} has an empty ore table")));
            }
            let mut total = 0.0;
            for row in &mine.ores {
                if !ores.contains_key(&row.ore) {
                    return Err(EconomyError::CatalogLoad(format!(
                        "mine {key} references unknown ore {}",
                        row.ore
                    )));
                }
                if !row.weight.is_finite() || row.weight < 0.0 {
                    return Err(EconomyError::CatalogLoad(format!(
                        "mine {key} has invalid weight {} for {}",
                        row.weight, row.ore
                    )));
                }
                total += row.weight;
            }
            if total <= 0.0 {
                return Err(EconomyError::CatalogLoad(format!("mine {key} has zero total weight")));
            }
            let table = mine
                .ores
                .into_iter()
                .map(|row| MineOre {
                    ore: row.ore,
                    weight: row.weight / total,
                })
                .collect();
            mines.insert(
                key.clone(),
                Mine {
                    name: mine.name.unwrap_or_else(|| key.to_string()),
                    key,
                    required_xp: mine.required_xp,
                    table,
                },
            );
        }

        // Starter kit
        if !mines.contains_key(&doc.starter.mine) {
            return Err(EconomyError::CatalogLoad(format!(
                "starter mine {} is not defined",
                doc.starter.mine
            )));
        }
        if let Some(gear) = doc.starter.gear.iter().find(|gear| !is_gear(gear)) {
            return Err(EconomyError::CatalogLoad(format!("starter gear {gear} is not a gear tier")));
        }

        // Gear shop
        if let Some(gear) = doc.gear_shop.keys().find(|gear| !is_gear(gear)) {
            return Err(EconomyError::CatalogLoad(format!("gear shop sells {gear}, which is not a gear tier")));
        }

        // Recipes
        let mut recipes = RecipeBook::new();
        for (key, recipe) in doc.recipes {
            for item in recipe.inputs.keys().chain(recipe.outputs.keys()) {
                require_item(item, &format!("recipe {key}"))?;
            }
            let name = recipe.name.unwrap_or_else(|| key.to_string());
            recipes.add_recipe(Recipe::new(key, name, recipe.inputs, recipe.outputs)?.with_xp(recipe.xp))?;
        }
        if !recipes.validate_no_cycles() {
            let cycle = recipes
                .find_cycle()
                .map(|keys| keys.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> "))
                .unwrap_or_default();
            return Err(EconomyError::CatalogLoad(format!("recipe cycle detected: {cycle}")));
        }

        Ok(Self {
            gear_tiers: doc.gear_tiers,
            starter: StarterKit {
                mine: doc.starter.mine,
                gear: doc.starter.gear,
                currency: doc.starter.currency,
            },
            items,
            ores,
            mines,
            gear_shop: doc.gear_shop,
            recipes,
        })
    }

    /// The strongest gear tier present in `inventory`, if any.
    #[must_use]
    pub fn effective_gear(&self, inventory: &Inventory) -> Option<&ItemKey> {
        self.gear_tiers.iter().rev().find(|gear| inventory.owns(gear.as_str()))
    }

    /// What new players start with.
    #[must_use]
    pub fn starter(&self) -> &StarterKit {
        &self.starter
    }

    /// Looks up an item.
    #[must_use]
    pub fn item(&self, key: &str) -> Option<&ItemDef> {
        self.items.get(key)
    }

    /// Sell price of an item, if it is sellable.
    #[must_use]
    pub fn sell_price(&self, key: &str) -> Option<u64> {
        self.items.get(key).and_then(|item| item.sell_price)
    }

    /// Display name for an item, falling back to the key.
    #[must_use]
    pub fn display_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.items.get(key).map_or(key, |item| item.name.as_str())
    }

    /// Looks up an ore.
    #[must_use]
    pub fn ore(&self, key: &str) -> Option<&Ore> {
        self.ores.get(key)
    }

    /// Looks up a mine.
    #[must_use]
    pub fn mine(&self, key: &str) -> Option<&Mine> {
        self.mines.get(key)
    }

    /// All mines in key order.
    pub fn mines(&self) -> impl Iterator<Item = &Mine> {
        self.mines.values()
    }

    /// Shop price of a gear tier, if the shop sells it.
    #[must_use]
    pub fn gear_price(&self, key: &str) -> Option<u64> {
        self.gear_shop.get(key).copied()
    }

    /// Shop entries ordered by gear tier, weakest first.
    pub fn gear_shop(&self) -> impl Iterator<Item = (&ItemKey, u64)> {
        self.gear_tiers
            .iter()
            .filter_map(|gear| self.gear_shop.get(gear).map(|&price| (gear, price)))
    }

    /// The processing recipes.
    #[must_use]
    pub fn recipes(&self) -> &RecipeBook {
        &self.recipes
    }
}
