use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use matrix_ledger::{
    config::MatrixConfig,
    engine::PlacementEngine,
    registry::{Level, MemberId},
    store::Snapshot,
    treasury::Amount,
};

/// Referral-matrix ledger: register members, buy levels, inspect routing.
#[derive(Parser)]
#[command(name = "matrix", version)]
struct Cli {
    /// State file holding the matrix snapshot
    #[arg(long, global = true, default_value = "matrix-state.json")]
    state: PathBuf,

    /// TOML config read by `init`
    #[arg(long, global = true, default_value = "matrix.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new state file with the given root address
    Init {
        #[arg(long)]
        root: String,
        /// Overwrite an existing state file
        #[arg(long)]
        force: bool,
    },
    /// Register a member; payment defaults to the level-1 price
    Join {
        #[arg(long)]
        address: String,
        #[arg(long)]
        sponsor: Option<MemberId>,
        #[arg(long)]
        payment: Option<Amount>,
    },
    /// Buy the next level or reinvest an owned one
    Buy {
        #[arg(long)]
        address: String,
        #[arg(long)]
        level: Level,
        #[arg(long)]
        payment: Option<Amount>,
    },
    /// Member record, level states and balance
    Show {
        #[arg(long)]
        address: String,
    },
    /// Who a purchase of `level` would pay
    Upliner {
        #[arg(long)]
        address: String,
        #[arg(long)]
        level: Level,
    },
    /// First member at or above `address` with room at `level`
    FreeRef {
        #[arg(long)]
        address: String,
        #[arg(long)]
        level: Level,
    },
    /// Level price table
    Prices,
    /// Current state root
    StateRoot,
}

fn print(value: serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn load(cli: &Cli) -> anyhow::Result<Snapshot> {
    Snapshot::load(&cli.state)
        .with_context(|| format!("load {} (run `matrix init` first)", cli.state.display()))
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Command::Init { root, force } => {
            if cli.state.exists() && !force {
                bail!("{} already exists (use --force)", cli.state.display());
            }
            let config = MatrixConfig::load(&cli.config)?;
            let snapshot = Snapshot::new(PlacementEngine::new(config, root)?);
            snapshot.save(&cli.state)?;
            print(json!({ "root": root, "state": cli.state }))
        }
        Command::Join {
            address,
            sponsor,
            payment,
        } => {
            let mut snapshot = load(&cli)?;
            let Snapshot { engine, balances } = &mut snapshot;
            let payment = match payment {
                Some(p) => *p,
                None => engine.level_price(1)?,
            };
            let payout = engine.join(address, *sponsor, payment, balances)?;
            snapshot.save(&cli.state)?;
            print(serde_json::to_value(payout)?)
        }
        Command::Buy {
            address,
            level,
            payment,
        } => {
            let mut snapshot = load(&cli)?;
            let Snapshot { engine, balances } = &mut snapshot;
            let payment = match payment {
                Some(p) => *p,
                None => engine.level_price(*level)?,
            };
            let payout = engine.purchase_level(address, *level, payment, balances)?;
            snapshot.save(&cli.state)?;
            print(serde_json::to_value(payout)?)
        }
        Command::Show { address } => {
            let snapshot = load(&cli)?;
            let engine = &snapshot.engine;
            let member = engine.member(address)?;
            let mut levels = Vec::new();
            for (level, _) in engine.prices().iter() {
                levels.push(json!({
                    "level": level,
                    "state": engine.level_state(address, level)?,
                    "full": engine.is_level_full(address, level)?,
                }));
            }
            print(json!({
                "member": member,
                "depth": engine.depth(address)?,
                "current_level_full": engine.is_current_level_full(address)?,
                "balance": snapshot.balances.balance(address),
                "levels": levels,
            }))
        }
        Command::Upliner { address, level } => {
            let snapshot = load(&cli)?;
            let engine = &snapshot.engine;
            print(json!({
                "address": address,
                "level": level,
                "reinvestment": engine.is_reinvestment(address, *level).ok(),
                "upliner": engine.resolve_recipient(address, *level)?,
            }))
        }
        Command::FreeRef { address, level } => {
            let snapshot = load(&cli)?;
            print(json!({ "free_ref": snapshot.engine.find_capacity(address, *level)? }))
        }
        Command::Prices => {
            let snapshot = load(&cli)?;
            let prices: Vec<_> = snapshot
                .engine
                .prices()
                .iter()
                .map(|(level, price)| json!({ "level": level, "price": price }))
                .collect();
            print(json!({ "level_count": snapshot.engine.level_count(), "prices": prices }))
        }
        Command::StateRoot => {
            let snapshot = load(&cli)?;
            print(json!({
                "height": snapshot.engine.height(),
                "state_root": hex::encode(snapshot.state_root()),
            }))
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    if cli.state.is_dir() {
        bail!("--state must be a file, got directory {}", cli.state.display());
    }
    run(cli)
}
