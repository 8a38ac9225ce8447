mod builder;
mod cli;
mod completion;
mod db;
mod error;
mod fmt;
mod importer;
mod models;
mod parser;
mod profiles;
mod settings;
mod store;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{AccountsCommands, Cli, Commands, PartnersCommands, ProfilesCommands};

/// Diagnostics go to stderr. `RUST_LOG` wins over the `log_filter` setting.
/// A bad settings file is reported once the subscriber is up.
fn init_tracing() {
    let settings = settings::read_settings(&settings::settings_path());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let log_filter = match &settings {
            Ok(s) => s.log_filter.clone(),
            Err(_) => settings::Settings::default().log_filter,
        };
        EnvFilter::new(log_filter)
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    if let Err(e) = settings {
        tracing::warn!("{e}; using default settings");
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let result = match cli.command {
        Commands::Init { data_dir } => cli::init::run(data_dir),
        Commands::Accounts { command } => match command {
            AccountsCommands::Add { code, name } => cli::accounts::add(&code, name.as_deref()),
            AccountsCommands::List => cli::accounts::list(),
        },
        Commands::Partners { command } => match command {
            PartnersCommands::Add {
                name,
                label,
                receivable,
                payable,
            } => cli::partners::add(&name, label.as_deref(), receivable.as_deref(), payable.as_deref()),
            PartnersCommands::Order { name, partner } => cli::partners::add_order(&name, &partner),
            PartnersCommands::Invoice { number, partner } => cli::partners::add_invoice(&number, &partner),
            PartnersCommands::List => cli::partners::list(),
        },
        Commands::Profiles { command } => match command {
            ProfilesCommands::Add(args) => cli::profiles::add(&args),
            ProfilesCommands::List => cli::profiles::list(),
            ProfilesCommands::Rules => cli::profiles::rules(),
        },
        Commands::Import {
            file,
            profile,
            file_type,
        } => cli::import::run(&file, &profile, file_type.as_deref()),
        Commands::Complete { r#move } => cli::complete::run(&r#move),
        Commands::Status => cli::status::run(),
    };

    if let Err(e) = result {
        tracing::debug!(kind = e.kind(), user_input = e.is_user_input(), "Command failed");
        eprintln!("Error: {e}");
        if e.is_configuration() {
            eprintln!("Check the profile with `statement-import profiles list`.");
        }
        std::process::exit(1);
    }
}
