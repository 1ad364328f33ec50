//! Rockyflow command-line driver.
//!
//! Runs one engine command for one player and prints the result.
//! Run with: `rockyflow <PLAYER_ID> <COMMAND>`

use clap::{Parser, Subcommand};
use rockyflow_economy::{Catalog, EconomyError, EngineConfig, ItemCounts, ItemKey, MiningEngine};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Idle mining economy
#[derive(Parser)]
#[command(name = "rockyflow")]
#[command(about = "Mine, sell and smelt from the terminal", long_about = None)]
#[command(version)]
struct Cli {
    /// Engine settings file
    #[arg(long, default_value = "data/rockyflow.toml")]
    config: PathBuf,

    /// Player to act as
    player_id: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a mining session
    Mine,

    /// End the session and collect the loot
    End,

    /// Show inventory, balance and level
    Stats,

    /// List the gear shop
    Shop,

    /// Buy a piece of gear
    Buy {
        /// Gear key, e.g. stone_pickaxe
        gear: String,
    },

    /// List items that can be sold
    Sellable,

    /// Sell whole stacks
    Sell {
        /// Item keys to sell
        #[arg(required_unless_present = "all")]
        items: Vec<String>,

        /// Sell every sellable item
        #[arg(long, conflicts_with = "items")]
        all: bool,
    },

    /// List mines
    Mines,

    /// Move to another mine
    Travel {
        /// Mine key
        mine: String,
    },

    /// List processing recipes
    Recipes,

    /// Run a recipe
    Process {
        /// Recipe key
        recipe: String,

        /// Number of runs
        #[arg(default_value_t = 1)]
        times: u64,
    },

    /// Rewrite the player log down to one entry per player
    Compact,
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = EngineConfig::load(&cli.config)?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let engine = MiningEngine::open(&config)?;

    match run(&engine, cli.player_id, cli.command) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) if e.is_player_facing() => {
            println!("{e}");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            tracing::error!(player_id = cli.player_id, error = %e, "command failed");
            Err(e.into())
        }
    }
}

fn run(engine: &MiningEngine, player_id: u64, command: Command) -> Result<(), EconomyError> {
    match command {
        Command::Mine => {
            let start = engine.start_session(player_id)?;
            let gear = start
                .gear
                .as_ref()
                .map_or("bare hands", |g| engine.catalog().display_name(g.as_str()));
            println!("Mining in {} with {gear}.", start.mine_name);
        }
        Command::End => {
            let report = engine.close_session(player_id)?;
            println!("Session over after {:.1} minutes.", report.duration.as_secs_f64() / 60.0);
            if report.drops.is_empty() {
                println!("Nothing found.");
            } else {
                println!("Found {}.", render_counts(engine, &report.drops));
            }
            println!("+{} xp (total {})", report.xp_gained, report.experience);
            if report.exhausted {
                println!("The session ran long; loot was capped.");
            }
        }
        Command::Stats => {
            let stats = engine.view_stats(player_id)?;
            println!("Level {} ({} xp)", stats.level, stats.experience);
            println!("Balance: {}", stats.currency);
            println!("Mine: {}", stats.mine_name);
            if let Some(elapsed) = stats.session_elapsed {
                println!("Mining for {:.1} minutes", elapsed.as_secs_f64() / 60.0);
            }
            for (item, count) in stats.inventory.iter() {
                println!("  {count}x {}", engine.catalog().display_name(item.as_str()));
            }
        }
        Command::Shop => {
            for listing in engine.list_shop(player_id)? {
                let tag = if listing.owned {
                    "owned"
                } else if listing.affordable {
                    "buy"
                } else {
                    "locked"
                };
                println!("  {:<20} {:>8}  [{tag}]", listing.name, listing.price);
            }
        }
        Command::Buy { gear } => {
            let receipt = engine.purchase(player_id, &gear)?;
            println!("Bought {} for {}. Balance: {}", receipt.name, receipt.price, receipt.currency);
        }
        Command::Sellable => {
            let listings = engine.list_sellable(player_id)?;
            if listings.is_empty() {
                println!("Nothing to sell.");
            }
            for listing in listings {
                println!(
                    "  {} {:<16} {:>6} x {:<4} = {}",
                    listing.emoji, listing.name, listing.count, listing.unit_price, listing.total
                );
            }
        }
        Command::Sell { items, all } => {
            let receipt = if all {
                engine.sell_all(player_id)?
            } else {
                let keys = item_keys(engine.catalog(), items)?;
                engine.sell(player_id, &keys)?
            };
            for line in &receipt.lines {
                println!("  sold {}x {} for {}", line.count, line.name, line.proceeds);
            }
            println!("+{} (balance {})", receipt.proceeds, receipt.currency);
        }
        Command::Mines => {
            for listing in engine.list_mines(player_id)? {
                let marker = if listing.current { "*" } else { " " };
                let state = if listing.unlocked { "open" } else { "locked" };
                println!("{marker} {:<20} {:>6} xp  [{state}]", listing.name, listing.required_xp);
            }
        }
        Command::Travel { mine } => {
            let receipt = engine.travel(player_id, &mine)?;
            println!("Travelled to {}.", receipt.name);
        }
        Command::Recipes => {
            for listing in engine.list_recipes(player_id)? {
                println!(
                    "  {:<16} {} -> {}  (+{} xp, can run {})",
                    listing.name,
                    render_counts(engine, &listing.inputs),
                    render_counts(engine, &listing.outputs),
                    listing.xp,
                    listing.max_runs
                );
            }
        }
        Command::Process { recipe, times } => {
            let receipt = engine.process(player_id, &recipe, times)?;
            println!(
                "Used {}, made {}. +{} xp (total {})",
                render_counts(engine, &receipt.output.consumed),
                render_counts(engine, &receipt.output.produced),
                receipt.output.xp,
                receipt.experience
            );
        }
        Command::Compact => {
            engine.compact()?;
            println!("Player log compacted.");
        }
    }
    Ok(())
}

/// Turns typed item names into catalog keys, rejecting names the catalog
/// does not know.
fn item_keys(catalog: &Catalog, items: Vec<String>) -> Result<Vec<ItemKey>, EconomyError> {
    items
        .into_iter()
        .map(|item| match catalog.item(&item) {
            Some(_) => Ok(ItemKey::new(item)),
            None => Err(EconomyError::UnknownItem(item)),
        })
        .collect()
}

fn render_counts(engine: &MiningEngine, counts: &ItemCounts) -> String {
    counts
        .iter()
        .map(|(item, count)| format!("{count}x {}", engine.catalog().display_name(item.as_str())))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
gear_tiers = ["pick"]

[starter]
mine = "quarry"
gear = ["pick"]

[items.coal]
name = "coal"
sell_price = 1

[items.pick]
name = "pick"

[ores.coal_ore]
item = "coal"
xp = 1
cost = { pick = 10 }

[mines.quarry]
ores = [{ ore = "coal_ore", weight = 1.0 }]
"#;

    #[test]
    fn test_item_keys_accepts_catalog_items() {
        let catalog = Catalog::from_toml_str(CATALOG).unwrap();
        let keys = item_keys(&catalog, vec!["coal".into(), "pick".into()]).unwrap();
        assert_eq!(keys, vec![ItemKey::new("coal"), ItemKey::new("pick")]);
    }

    #[test]
    fn test_item_keys_rejects_unknown_names() {
        let catalog = Catalog::from_toml_str(CATALOG).unwrap();
        let err = item_keys(&catalog, vec!["coal".into(), "cola".into()]).unwrap_err();
        assert_eq!(err, EconomyError::UnknownItem("cola".into()));
        assert!(err.is_player_facing());
    }

    #[test]
    fn test_cli_parses_sell_all() {
        let cli = Cli::try_parse_from(["rockyflow", "42", "sell", "--all"]).unwrap();
        assert_eq!(cli.player_id, 42);
        assert!(matches!(cli.command, Command::Sell { all: true, .. }));
        assert!(Cli::try_parse_from(["rockyflow", "42", "sell"]).is_err());
    }
}
