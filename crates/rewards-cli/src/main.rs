//! Rewards CLI - command-line surface for the rewards ledger.
//!
//! Thin glue over `rewards-core`: opens the SQLite-backed store, runs one
//! command, prints human-readable (or JSON) output. All policy lives in the
//! core crate.

mod cli;
mod remote;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use clap::Parser;
use log::debug;

use rewards_core::clock::{Clock, IdGenerator};
use rewards_core::model::{EntryType, RedemptionTransaction, RewardCategory, RewardEntry};
use rewards_core::storage::{DateRange, HistoryFilter};
use rewards_core::{
    CancelToken, LedgerStore, SqliteStore, SyncEngine, SystemClock, UuidGenerator,
};

use cli::{CategoryCommands, Cli, Commands};
use remote::JsonFileRemote;

/// (id, name, color, icon) of the categories every ledger starts with.
const DEFAULT_CATEGORIES: &[(&str, &str, &str, &str)] = &[
    ("chores", "Chores", "#4CAF50", "broom"),
    ("homework", "Homework", "#2196F3", "book"),
    ("kindness", "Kindness", "#E91E63", "heart"),
    ("exercise", "Exercise", "#FF9800", "run"),
];

fn main() -> anyhow::Result<()> {
    // handle kept alive for the whole run; dropping it stops the logger
    let _logger = flexi_logger::Logger::try_with_env_or_str("warn")
        .context("invalid log specification")?
        .start()
        .context("failed to initialize logging")?;

    let cli = Cli::parse();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let ledger = cli.ledger.clone().ok_or_else(|| {
        anyhow!("No ledger path provided. Use --ledger or set REWARDS_LEDGER.")
    })?;
    debug!("opening ledger at {ledger}");
    let store: Arc<dyn LedgerStore> = Arc::new(
        SqliteStore::open(Path::new(&ledger), clock.clone())
            .with_context(|| format!("cannot open ledger at {ledger}"))?,
    );
    let user = cli.user.as_str();
    let now = clock.now();

    match cli.command {
        Commands::Init => {
            let mut created = 0;
            for (id, name, color, icon) in DEFAULT_CATEGORIES {
                if store.get_category(user, id)?.is_some() {
                    continue;
                }
                let category = RewardCategory::new(*id, name, None, color, icon, true)?;
                store.add_category(user, category)?;
                created += 1;
            }
            if !cli.quiet {
                println!("Initialized ledger at {ledger} ({created} default categories)");
            }
        }
        Commands::Earn(args) => {
            let entry_type = EntryType::parse(&args.entry_type)?;
            let entry = RewardEntry::new(
                UuidGenerator.next_id(),
                user,
                args.points,
                &args.description,
                &args.category,
                entry_type,
                now,
            )?;
            let stored = store.add_entry(entry)?;
            if !cli.quiet {
                println!("Recorded entry {} ({:+} points)", stored.id, stored.points);
                println!("Balance: {}", store.total_points(user)?);
            }
        }
        Commands::Category(CategoryCommands::Add(args)) => {
            let category = RewardCategory::new(
                UuidGenerator.next_id(),
                &args.name,
                args.description.as_deref(),
                &args.color,
                &args.icon,
                false,
            )?;
            let stored = store.add_category(user, category)?;
            if !cli.quiet {
                println!("Added category {} ({})", stored.name, stored.id);
            }
        }
        Commands::Category(CategoryCommands::List) => {
            let categories = store.list_categories(user)?;
            if !cli.quiet {
                println!("ID | NAME | DEFAULT | DESCRIPTION");
            }
            for category in categories {
                println!(
                    "{} | {} | {} | {}",
                    category.id,
                    category.name,
                    if category.is_default { "yes" } else { "no" },
                    category.description.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Redeem(args) => {
            let tx = RedemptionTransaction::create(
                user,
                &args.option_id,
                args.points,
                args.notes.as_deref(),
                &UuidGenerator,
                clock.as_ref(),
            )?;
            let stored = store.add_redemption(tx)?;
            if !cli.quiet {
                println!(
                    "Redemption {} pending ({} points on {})",
                    stored.id, stored.points_used, stored.option_id
                );
            }
        }
        Commands::Complete { id } => {
            let tx = store
                .get_redemption(user, &id)?
                .ok_or_else(|| anyhow!("Redemption {id} not found"))?;
            let completed = tx.complete(now)?;
            store.update_redemption(completed)?;
            if !cli.quiet {
                println!("Redemption {id} completed");
            }
        }
        Commands::Cancel(args) => {
            let tx = store
                .get_redemption(user, &args.id)?
                .ok_or_else(|| anyhow!("Redemption {} not found", args.id))?;
            let cancelled = tx.cancel(&args.reason, now)?;
            store.update_redemption(cancelled)?;
            if !cli.quiet {
                println!("Redemption {} cancelled", args.id);
            }
        }
        Commands::Balance => {
            println!("{}", store.total_points(user)?);
        }
        Commands::History(args) => {
            let filter = HistoryFilter {
                page: args.page,
                limit: args.limit,
                date_range: date_range(args.since.as_deref(), args.until.as_deref())?,
                category_id: args.category.clone(),
                entry_type: args
                    .entry_type
                    .as_deref()
                    .map(EntryType::parse)
                    .transpose()?,
            };
            let page = store.history(user, &filter)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else {
                if !cli.quiet {
                    println!(
                        "Page {}/{} ({} entries total)",
                        page.page,
                        page.total.div_ceil(u64::from(page.limit)).max(1),
                        page.total
                    );
                    println!("ID | CREATED_AT | POINTS | TYPE | DESCRIPTION");
                }
                for entry in &page.items {
                    println!(
                        "{} | {} | {:+} | {} | {}",
                        entry.id,
                        entry.created_at.to_rfc3339(),
                        entry.points,
                        entry.entry_type,
                        entry.description
                    );
                }
            }
        }
        Commands::Stats => {
            let stats = store.redemption_stats(user)?;
            println!("Redemptions: {}", stats.total_transactions);
            println!("- completed: {}", stats.completed_transactions);
            println!("- cancelled: {}", stats.cancelled_transactions);
            println!("- pending:   {}", stats.pending_transactions());
            println!("Points redeemed: {}", stats.total_points_redeemed);
            println!("Success rate: {:.1}%", stats.success_rate());
            println!(
                "Average points per redemption: {:.1}",
                stats.average_points_per_redemption()
            );
            if let Some(favorite) = &stats.favorite_category {
                println!("Favorite reward: {favorite}");
            }
        }
        Commands::Sync(args) => {
            debug!("sync pass for {user} against {}", args.remote);
            let remote = Arc::new(JsonFileRemote::new(&args.remote));
            let engine = SyncEngine::new(store, remote, clock);
            let token = match args.timeout {
                Some(seconds) => CancelToken::with_timeout(Duration::from_secs(seconds)),
                None => CancelToken::new(),
            };
            let result = engine.sync(user, &token)?;
            if !cli.quiet {
                println!(
                    "Synced: {} uploaded, {} downloaded",
                    result.uploaded_count, result.downloaded_count
                );
            }
            if result.has_conflicts() {
                eprintln!("{} records conflict and stay pending:", result.conflicted_entries.len());
                for key in &result.conflicted_entries {
                    eprintln!("- {key}");
                }
            }
        }
    }

    Ok(())
}

fn date_range(since: Option<&str>, until: Option<&str>) -> anyhow::Result<Option<DateRange>> {
    if since.is_none() && until.is_none() {
        return Ok(None);
    }
    Ok(Some(DateRange {
        from: since.map(parse_datetime).transpose()?,
        to: until.map(parse_datetime).transpose()?,
    }))
}

fn parse_datetime(value: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid date '{value}' (expected RFC 3339)"))
}
