pub mod accounts;
pub mod complete;
pub mod import;
pub mod init;
pub mod partners;
pub mod profiles;
pub mod status;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "statement-import",
    about = "Import bank statements into accounting moves and complete them with matching rules."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Choose a data directory and initialize the database.
    Init {
        /// Path for data (default: ~/Documents/statement-import)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Manage the chart of accounts.
    Accounts {
        #[command(subcommand)]
        command: AccountsCommands,
    },
    /// Manage partners and the documents that identify them.
    Partners {
        #[command(subcommand)]
        command: PartnersCommands,
    },
    /// Manage import profiles.
    Profiles {
        #[command(subcommand)]
        command: ProfilesCommands,
    },
    /// Import a statement file (CSV, XLS or XLSX) through a profile.
    Import {
        /// Path to the statement file
        file: String,
        /// Import profile name
        #[arg(long)]
        profile: String,
        /// File type: csv, xls, xlsx (default: file extension)
        #[arg(long = "type")]
        file_type: Option<String>,
    },
    /// Run the completion rules on the open lines of a move.
    Complete {
        /// Move name, e.g. BNK/2025/0001
        r#move: String,
    },
    /// Show current database and summary statistics.
    Status,
}

#[derive(Subcommand)]
pub enum AccountsCommands {
    /// Add an account.
    Add {
        /// Account code, e.g. 512000
        code: String,
        /// Account name
        #[arg(long)]
        name: Option<String>,
    },
    /// List all accounts.
    List,
}

#[derive(Subcommand)]
pub enum PartnersCommands {
    /// Add a partner.
    Add {
        /// Partner name
        name: String,
        /// Text found in statement labels for this partner; values separated by ';', '%' and '_' as wildcards
        #[arg(long)]
        label: Option<String>,
        /// Receivable account code
        #[arg(long)]
        receivable: Option<String>,
        /// Payable account code
        #[arg(long)]
        payable: Option<String>,
    },
    /// Register a sale order reference for a partner.
    Order {
        /// Sale order name, e.g. SO001
        name: String,
        #[arg(long)]
        partner: String,
    },
    /// Register an invoice number for a partner.
    Invoice {
        /// Invoice number
        number: String,
        #[arg(long)]
        partner: String,
    },
    /// List all partners.
    List,
}

#[derive(Subcommand)]
pub enum ProfilesCommands {
    /// Add an import profile.
    Add(AddProfileArgs),
    /// List all profiles.
    List,
    /// List the available completion rules.
    Rules,
}

#[derive(Args)]
pub struct AddProfileArgs {
    /// Profile name
    pub name: String,
    /// Journal code used in move names
    #[arg(long)]
    pub code: String,
    /// Currency (default: company currency)
    #[arg(long)]
    pub currency: Option<String>,
    /// Import type key
    #[arg(long = "import-type", default_value = "generic_csvxls_so")]
    pub import_type: String,
    /// Account code used for money paid out
    #[arg(long = "debit-account")]
    pub debit_account: Option<String>,
    /// Account code used for money received
    #[arg(long = "credit-account")]
    pub credit_account: Option<String>,
    /// Account code for bank commissions
    #[arg(long = "commission-account")]
    pub commission_account: Option<String>,
    /// Account code for the counterpart line
    #[arg(long = "receivable-account")]
    pub receivable_account: Option<String>,
    /// Partner set on commission and counterpart lines
    #[arg(long)]
    pub partner: Option<String>,
    /// Completion rule function to attach (repeatable)
    #[arg(long = "rule")]
    pub rules: Vec<String>,
    /// Run completion right after each import
    #[arg(long = "auto-complete")]
    pub auto_complete: bool,
    /// Do not use this profile for completion
    #[arg(long = "no-completion")]
    pub no_completion: bool,
}
