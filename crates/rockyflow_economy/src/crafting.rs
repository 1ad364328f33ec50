//! # Processing Recipes - Directed Acyclic Graph (DAG)
//!
//! **Transactional Recipe System with Cycle Detection**
//!
//! Raw drops (iron, gold) are refined into higher-value goods (ingots) by
//! processing recipes. Guarantees:
//!
//! 1. **No Cycles**: The recipe graph is validated to be acyclic when the
//!    catalog loads; a cycle is a fatal catalog error
//! 2. **Transactional**: Processing is atomic - all inputs consumed OR nothing happens
//! 3. **No Duplication**: Every recipe has at least one input, and no recipe
//!    consumes its own output, directly or through other recipes
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut book = RecipeBook::new();
//! book.add_recipe(Recipe::new(
//!     RecipeKey::new("iron_ingot"),
//!     "iron ingot".into(),
//!     [(ItemKey::new("iron"), 3), (ItemKey::new("coal"), 1)].into(),
//!     [(ItemKey::new("iron_ingot"), 1)].into(),
//! )?.with_xp(8))?;
//!
//! assert!(book.validate_no_cycles());
//! book.process(&mut inventory, "iron_ingot", 2)?;
//! ```

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{EconomyError, EconomyResult};
use crate::inventory::{Inventory, ItemCounts};
use crate::keys::{ItemKey, RecipeKey};

/// A processing recipe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Recipe {
    /// Unique recipe key.
    pub key: RecipeKey,
    /// Human-readable name.
    pub name: String,
    /// Items consumed by one run.
    pub inputs: ItemCounts,
    /// Items produced by one run.
    pub outputs: ItemCounts,
    /// Experience awarded per run.
    pub xp: u64,
}

impl Recipe {
    /// Creates a new recipe with basic validation.
    ///
    /// # Errors
    ///
    /// Returns error if the recipe has no inputs, no outputs, or a zero quantity.
    pub fn new(
        key: RecipeKey,
        name: String,
        inputs: ItemCounts,
        outputs: ItemCounts,
    ) -> EconomyResult<Self> {
        if inputs.is_empty() {
            return Err(EconomyError::CatalogLoad(format!(
                "recipe {key} must have at least one input"
            )));
        }
        if outputs.is_empty() {
            return Err(EconomyError::CatalogLoad(format!(
                "recipe {key} must have at least one output"
            )));
        }
        if let Some((item, _)) = inputs.iter().chain(outputs.iter()).find(|(_, &qty)| qty == 0) {
            return Err(EconomyError::CatalogLoad(format!(
                "recipe {key} lists {item} with quantity 0"
            )));
        }

        Ok(Self {
            key,
            name,
            inputs,
            outputs,
            xp: 0,
        })
    }

    /// Sets experience awarded per run.
    #[must_use]
    pub fn with_xp(mut self, xp: u64) -> Self {
        self.xp = xp;
        self
    }
}

/// Result of a successful processing run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessOutput {
    /// The recipe that was run.
    pub recipe: RecipeKey,
    /// How many times it ran.
    pub times: u64,
    /// Items consumed in total.
    pub consumed: ItemCounts,
    /// Items produced in total.
    pub produced: ItemCounts,
    /// Experience earned in total.
    pub xp: u64,
}

/// The recipe graph.
///
/// Maintains integrity of the item economy by detecting cycles that would
/// allow infinite item generation, and by making every run transactional.
#[derive(Clone, Debug, Default)]
pub struct RecipeBook {
    /// All recipes indexed by key.
    recipes: BTreeMap<RecipeKey, Recipe>,
    /// Items that can be produced, mapped to recipes that produce them.
    item_producers: BTreeMap<ItemKey, Vec<RecipeKey>>,
    /// Items that are consumed, mapped to recipes that consume them.
    item_consumers: BTreeMap<ItemKey, Vec<RecipeKey>>,
}

impl RecipeBook {
    /// Creates a new empty recipe book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a recipe to the graph.
    ///
    /// # Errors
    ///
    /// Returns error if the recipe key already exists.
    pub fn add_recipe(&mut self, recipe: Recipe) -> EconomyResult<()> {
        if self.recipes.contains_key(&recipe.key) {
            return Err(EconomyError::CatalogLoad(format!(
                "recipe {} already exists",
                recipe.key
            )));
        }

        for item in recipe.inputs.keys() {
            self.item_consumers
                .entry(item.clone())
                .or_default()
                .push(recipe.key.clone());
        }

        for item in recipe.outputs.keys() {
            self.item_producers
                .entry(item.clone())
                .or_default()
                .push(recipe.key.clone());
        }

        self.recipes.insert(recipe.key.clone(), recipe);
        Ok(())
    }

    /// Gets a recipe by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Recipe> {
        self.recipes.get(key)
    }

    /// Returns all recipes in key order.
    pub fn all_recipes(&self) -> impl Iterator<Item = &Recipe> {
        self.recipes.values()
    }

    /// Returns the number of recipes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    /// True if no recipes are defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    /// Validates that the recipe graph has no cycles.
    ///
    /// Uses Kahn's algorithm for topological sorting.
    /// If sorting succeeds, the graph is a valid DAG.
    #[must_use]
    pub fn validate_no_cycles(&self) -> bool {
        // Edge A -> B if A produces something B consumes
        let mut in_degree: BTreeMap<&RecipeKey, usize> =
            self.recipes.keys().map(|key| (key, 0)).collect();
        let mut adjacency: BTreeMap<&RecipeKey, Vec<&RecipeKey>> = BTreeMap::new();

        for (key, recipe) in &self.recipes {
            for item in recipe.inputs.keys() {
                let Some(producers) = self.item_producers.get(item) else {
                    continue;
                };
                // A recipe that consumes its own output is a cycle of one.
                for producer in producers {
                    adjacency.entry(producer).or_default().push(key);
                    *in_degree.entry(key).or_insert(0) += 1;
                }
            }
        }

        let mut queue: VecDeque<&RecipeKey> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&key, _)| key)
            .collect();

        let mut sorted_count = 0;

        while let Some(key) = queue.pop_front() {
            sorted_count += 1;

            for &neighbor in adjacency.get(key).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(neighbor) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        sorted_count == self.recipes.len()
    }

    /// Detects which recipes are involved in a cycle.
    ///
    /// Used to name the offending recipes in the catalog load error.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<RecipeKey>> {
        let mut visited = BTreeSet::new();
        let mut rec_stack = BTreeSet::new();
        let mut path = Vec::new();

        for start in self.recipes.keys() {
            if !visited.contains(start) {
                if let Some(cycle) = self.dfs_find_cycle(start, &mut visited, &mut rec_stack, &mut path) {
                    return Some(cycle);
                }
            }
        }

        None
    }

    fn dfs_find_cycle<'a>(
        &'a self,
        key: &'a RecipeKey,
        visited: &mut BTreeSet<&'a RecipeKey>,
        rec_stack: &mut BTreeSet<&'a RecipeKey>,
        path: &mut Vec<&'a RecipeKey>,
    ) -> Option<Vec<RecipeKey>> {
        visited.insert(key);
        rec_stack.insert(key);
        path.push(key);

        if let Some(recipe) = self.recipes.get(key) {
            for output in recipe.outputs.keys() {
                let Some(consumers) = self.item_consumers.get(output) else {
                    continue;
                };
                for consumer in consumers {
                    if !visited.contains(consumer) {
                        if let Some(cycle) = self.dfs_find_cycle(consumer, visited, rec_stack, path) {
                            return Some(cycle);
                        }
                    } else if rec_stack.contains(consumer) {
                        let cycle_start = path.iter().position(|&k| k == consumer).unwrap_or(0);
                        let mut cycle: Vec<RecipeKey> =
                            path[cycle_start..].iter().map(|&k| k.clone()).collect();
                        cycle.push(consumer.clone());
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        rec_stack.remove(key);
        None
    }

    /// How many times the recipe can run with the given inventory.
    #[must_use]
    pub fn max_runs(&self, inventory: &Inventory, key: &str) -> u64 {
        let Some(recipe) = self.recipes.get(key) else {
            return 0;
        };
        recipe
            .inputs
            .iter()
            .map(|(item, &qty)| inventory.count(item.as_str()) / qty)
            .min()
            .unwrap_or(0)
    }

    /// Checks if the inventory holds the inputs for `times` runs.
    ///
    /// # Errors
    ///
    /// - `UnknownRecipe` if the recipe doesn't exist
    /// - `InvalidQuantity` if `times` is zero
    /// - `InsufficientMaterials` naming the first missing input
    pub fn can_process(&self, inventory: &Inventory, key: &str, times: u64) -> EconomyResult<&Recipe> {
        let recipe = self
            .recipes
            .get(key)
            .ok_or_else(|| EconomyError::UnknownRecipe(key.to_string()))?;

        if times == 0 {
            return Err(EconomyError::InvalidQuantity(times));
        }

        for (item, &qty) in &recipe.inputs {
            let required = qty.checked_mul(times).ok_or(EconomyError::ArithmeticOverflow)?;
            let available = inventory.count(item.as_str());
            if available < required {
                return Err(EconomyError::InsufficientMaterials {
                    item: item.to_string(),
                    required,
                    available,
                });
            }
        }

        Ok(recipe)
    }

    /// Runs a recipe `times` times against the inventory.
    ///
    /// **ATOMIC**: Either all inputs are consumed and all outputs created,
    /// or the inventory is left exactly as it was.
    ///
    /// # Errors
    ///
    /// See [`RecipeBook::can_process`]; additionally `ArithmeticOverflow` if
    /// an output count would wrap.
    pub fn process(&self, inventory: &mut Inventory, key: &str, times: u64) -> EconomyResult<ProcessOutput> {
        let recipe = self.can_process(inventory, key, times)?;

        let consumed = scale(&recipe.inputs, times)?;
        let produced = scale(&recipe.outputs, times)?;
        let xp = recipe.xp.checked_mul(times).ok_or(EconomyError::ArithmeticOverflow)?;

        let snapshot = inventory.clone();
        for (item, &qty) in &consumed {
            if let Err(e) = inventory.remove(item, qty) {
                *inventory = snapshot;
                return Err(e);
            }
        }
        if let Err(e) = inventory.merge(&produced) {
            *inventory = snapshot;
            return Err(e);
        }

        Ok(ProcessOutput {
            recipe: recipe.key.clone(),
            times,
            consumed,
            produced,
            xp,
        })
    }
}

fn scale(items: &ItemCounts, times: u64) -> EconomyResult<ItemCounts> {
    items
        .iter()
        .map(|(item, &qty)| {
            qty.checked_mul(times)
                .map(|total| (item.clone(), total))
                .ok_or(EconomyError::ArithmeticOverflow)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(entries: &[(&str, u64)]) -> ItemCounts {
        entries.iter().map(|&(k, q)| (ItemKey::new(k), q)).collect()
    }

    fn recipe(key: &str, inputs: &[(&str, u64)], outputs: &[(&str, u64)]) -> Recipe {
        Recipe::new(RecipeKey::new(key), key.replace('_', " "), counts(inputs), counts(outputs)).unwrap()
    }

    fn create_test_book() -> RecipeBook {
        let mut book = RecipeBook::new();
        book.add_recipe(recipe("iron_ingot", &[("iron", 3), ("coal", 1)], &[("iron_ingot", 1)]).with_xp(8))
            .unwrap();
        book.add_recipe(recipe("steel_ingot", &[("iron_ingot", 2), ("coal", 2)], &[("steel_ingot", 1)]).with_xp(20))
            .unwrap();
        book
    }

    #[test]
    fn test_valid_dag() {
        let book = create_test_book();
        assert!(book.validate_no_cycles(), "Valid recipe chain should have no cycles");
        assert!(book.find_cycle().is_none());
    }

    #[test]
    fn test_detect_cycle() {
        let mut book = RecipeBook::new();
        book.add_recipe(recipe("a_to_b", &[("a", 1)], &[("b", 1)])).unwrap();
        book.add_recipe(recipe("b_to_c", &[("b", 1)], &[("c", 1)])).unwrap();
        book.add_recipe(recipe("c_to_a", &[("c", 1)], &[("a", 1)])).unwrap();

        assert!(!book.validate_no_cycles(), "Should detect cycle");
        let cycle = book.find_cycle().expect("cycle should be reported");
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn test_recipe_consuming_its_own_output_is_a_cycle() {
        let mut book = RecipeBook::new();
        book.add_recipe(recipe("dupe", &[("coal", 1)], &[("coal", 2)])).unwrap();

        assert!(!book.validate_no_cycles());
        let cycle = book.find_cycle().expect("self loop should be reported");
        assert_eq!(cycle, vec![RecipeKey::new("dupe"), RecipeKey::new("dupe")]);
    }

    #[test]
    fn test_catalyst_recipe_is_a_cycle() {
        let mut book = RecipeBook::new();
        book.add_recipe(recipe("catalysed", &[("catalyst", 1), ("ore", 2)], &[("catalyst", 1), ("bar", 1)]))
            .unwrap();
        assert!(!book.validate_no_cycles());
    }

    #[test]
    fn test_rejects_empty_and_zero_quantities() {
        assert!(Recipe::new(RecipeKey::new("x"), "x".into(), ItemCounts::new(), counts(&[("a", 1)])).is_err());
        assert!(Recipe::new(RecipeKey::new("x"), "x".into(), counts(&[("a", 1)]), ItemCounts::new()).is_err());
        assert!(Recipe::new(RecipeKey::new("x"), "x".into(), counts(&[("a", 0)]), counts(&[("b", 1)])).is_err());
    }

    #[test]
    fn test_duplicate_recipe_rejected() {
        let mut book = create_test_book();
        let dup = recipe("iron_ingot", &[("iron", 1)], &[("iron_ingot", 1)]);
        assert!(matches!(book.add_recipe(dup), Err(EconomyError::CatalogLoad(_))));
    }

    #[test]
    fn test_transactional_process_success() {
        let book = create_test_book();
        let mut inventory: Inventory = counts(&[("iron", 10), ("coal", 5)]).into_iter().collect();

        let out = book.process(&mut inventory, "iron_ingot", 3).unwrap();

        assert_eq!(out.xp, 24);
        assert_eq!(inventory.count("iron"), 1);
        assert_eq!(inventory.count("coal"), 2);
        assert_eq!(inventory.count("iron_ingot"), 3);
        assert_eq!(out.consumed, counts(&[("coal", 3), ("iron", 9)]));
    }

    #[test]
    fn test_transactional_process_rollback() {
        let book = create_test_book();
        let mut inventory: Inventory = counts(&[("iron", 2), ("coal", 5)]).into_iter().collect();
        let before = inventory.clone();

        let result = book.process(&mut inventory, "iron_ingot", 1);
        assert_eq!(
            result,
            Err(EconomyError::InsufficientMaterials { item: "iron".into(), required: 3, available: 2 })
        );
        assert_eq!(inventory, before);
    }

    #[test]
    fn test_zero_times_rejected() {
        let book = create_test_book();
        let mut inventory: Inventory = counts(&[("iron", 9), ("coal", 9)]).into_iter().collect();
        assert_eq!(book.process(&mut inventory, "iron_ingot", 0), Err(EconomyError::InvalidQuantity(0)));
    }

    #[test]
    fn test_unknown_recipe() {
        let book = create_test_book();
        let mut inventory = Inventory::new();
        assert_eq!(
            book.process(&mut inventory, "diamond_ring", 1),
            Err(EconomyError::UnknownRecipe("diamond_ring".into()))
        );
    }

    #[test]
    fn test_max_runs() {
        let book = create_test_book();
        let inventory: Inventory = counts(&[("iron", 10), ("coal", 2)]).into_iter().collect();
        assert_eq!(book.max_runs(&inventory, "iron_ingot"), 2);
        assert_eq!(book.max_runs(&inventory, "steel_ingot"), 0);
        assert_eq!(book.max_runs(&inventory, "missing"), 0);
    }

    #[test]
    fn test_process_chain() {
        let book = create_test_book();
        let mut inventory: Inventory = counts(&[("iron", 12), ("coal", 10)]).into_iter().collect();

        book.process(&mut inventory, "iron_ingot", 4).unwrap();
        book.process(&mut inventory, "steel_ingot", 2).unwrap();

        assert_eq!(inventory.count("steel_ingot"), 2);
        assert_eq!(inventory.count("iron_ingot"), 0);
        assert_eq!(inventory.count("coal"), 2);
    }
}
