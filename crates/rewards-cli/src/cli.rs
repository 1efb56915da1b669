use clap::{Args, Parser, Subcommand};

use rewards_core::VERSION;

/// Rewards - a household points and redemption ledger
#[derive(Parser)]
#[command(name = "rewards")]
#[command(author, version = VERSION, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the ledger database file
    #[arg(short, long, global = true, env = "REWARDS_LEDGER")]
    pub ledger: Option<String>,

    /// User the command acts for
    #[arg(short, long, global = true, env = "REWARDS_USER", default_value = "default")]
    pub user: String,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Arguments for the `earn` command
#[derive(Args)]
pub struct EarnArgs {
    /// Signed points to record (magnitude up to 10000)
    #[arg(value_name = "POINTS", allow_hyphen_values = true)]
    pub points: i64,

    /// What the points were for
    #[arg(value_name = "DESCRIPTION")]
    pub description: String,

    /// Category to file the entry under
    #[arg(short, long, value_name = "CATEGORY_ID")]
    pub category: String,

    /// Entry type (earned, adjusted, bonus)
    #[arg(long, value_name = "TYPE", default_value = "earned")]
    pub entry_type: String,
}

/// Arguments for `category add`
#[derive(Args)]
pub struct CategoryAddArgs {
    /// Category name (1-50 chars; letters, digits, space, - _ .)
    #[arg(value_name = "NAME")]
    pub name: String,

    /// Optional description (up to 200 chars)
    #[arg(long)]
    pub description: Option<String>,

    /// Display color
    #[arg(long, default_value = "#808080")]
    pub color: String,

    /// Icon name
    #[arg(long, default_value = "tag")]
    pub icon: String,
}

#[derive(Subcommand)]
pub enum CategoryCommands {
    /// Add a custom category
    Add(CategoryAddArgs),

    /// List categories for the user
    List,
}

/// Arguments for the `redeem` command
#[derive(Args)]
pub struct RedeemArgs {
    /// Reward option being redeemed
    #[arg(value_name = "OPTION_ID")]
    pub option_id: String,

    /// Points to spend (100 to 1000000)
    #[arg(value_name = "POINTS")]
    pub points: i64,

    /// Free-form notes
    #[arg(long)]
    pub notes: Option<String>,
}

/// Arguments for the `cancel` command
#[derive(Args)]
pub struct CancelArgs {
    /// Redemption transaction id
    #[arg(value_name = "ID")]
    pub id: String,

    /// Reason recorded in the transaction notes
    #[arg(long, default_value = "cancelled by user")]
    pub reason: String,
}

/// Arguments for the `history` command
#[derive(Args)]
pub struct HistoryArgs {
    /// 1-based page number
    #[arg(long, default_value_t = 1)]
    pub page: u32,

    /// Items per page
    #[arg(long, default_value_t = 20)]
    pub limit: u32,

    /// Filter by category
    #[arg(long, value_name = "CATEGORY_ID")]
    pub category: Option<String>,

    /// Filter by entry type (earned, adjusted, bonus)
    #[arg(long, value_name = "TYPE")]
    pub entry_type: Option<String>,

    /// Start of the time window (RFC 3339)
    #[arg(long)]
    pub since: Option<String>,

    /// End of the time window (RFC 3339)
    #[arg(long)]
    pub until: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `sync` command
#[derive(Args)]
pub struct SyncArgs {
    /// Path to the JSON-file remote store
    #[arg(long, value_name = "PATH")]
    pub remote: String,

    /// Abort the pass after this many seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new ledger with the default categories
    Init,

    /// Record a point movement
    Earn(EarnArgs),

    /// Manage reward categories
    #[command(subcommand)]
    Category(CategoryCommands),

    /// Redeem points against a reward option
    Redeem(RedeemArgs),

    /// Mark a pending redemption fulfilled
    Complete {
        /// Redemption transaction id
        #[arg(value_name = "ID")]
        id: String,
    },

    /// Cancel a pending redemption
    Cancel(CancelArgs),

    /// Show the current point balance
    Balance,

    /// List entries, newest first
    History(HistoryArgs),

    /// Show redemption statistics
    Stats,

    /// Reconcile local changes with a remote store
    Sync(SyncArgs),
}
