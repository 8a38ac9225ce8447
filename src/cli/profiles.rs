use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::cli::AddProfileArgs;
use crate::completion::RuleRegistry;
use crate::db::{account_id_by_code, get_connection, partner_id_by_name};
use crate::error::Result;
use crate::models::ImportType;
use crate::profiles::{create_profile, list_profiles, NewProfile};
use crate::settings::get_db_path;

pub fn add(args: &AddProfileArgs) -> Result<()> {
    let conn = get_connection(&get_db_path())?;
    let registry = RuleRegistry::with_builtins();
    let account = |code: &Option<String>| code.as_deref().map(|c| account_id_by_code(&conn, c)).transpose();

    let profile = NewProfile {
        name: args.name.clone(),
        code: args.code.clone(),
        currency: args.currency.clone(),
        import_type: ImportType::from_key(&args.import_type)?,
        default_debit_account_id: account(&args.debit_account)?,
        default_credit_account_id: account(&args.credit_account)?,
        commission_account_id: account(&args.commission_account)?,
        receivable_account_id: account(&args.receivable_account)?,
        partner_id: args
            .partner
            .as_deref()
            .map(|p| partner_id_by_name(&conn, p))
            .transpose()?,
        used_for_completion: !args.no_completion,
        launch_import_completion: args.auto_complete,
        rule_functions: args.rules.clone(),
    };
    create_profile(&conn, &registry, &profile)?;
    println!("Added profile: {} ({})", profile.name, profile.code);
    Ok(())
}

pub fn list() -> Result<()> {
    let conn = get_connection(&get_db_path())?;
    let profiles = list_profiles(&conn)?;

    let mut table = Table::new();
    table.set_header(vec!["Name", "Code", "Import Type", "Rules", "Auto-complete"]);
    for p in profiles {
        table.add_row(vec![
            Cell::new(p.name),
            Cell::new(p.code),
            Cell::new(
                ImportType::from_key(&p.import_type)
                    .map(|t| t.name().to_string())
                    .unwrap_or_else(|_| p.import_type.clone()),
            ),
            Cell::new(p.rule_count),
            Cell::new(if p.launch_import_completion { "yes" } else { "no" }),
        ]);
    }
    println!("Profiles\n{table}");
    Ok(())
}

pub fn rules() -> Result<()> {
    let conn = get_connection(&get_db_path())?;
    let registry = RuleRegistry::with_builtins();
    let mut stmt =
        conn.prepare("SELECT sequence, function_to_call, name FROM completion_rules ORDER BY sequence, id")?;
    let rows: Vec<(i64, String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut table = Table::new();
    table.set_header(vec!["Sequence", "Function", "Name"]);
    for (sequence, function, name) in rows {
        let function = if registry.contains(&function) {
            function.normal()
        } else {
            function.red()
        };
        table.add_row(vec![Cell::new(sequence), Cell::new(function), Cell::new(name)]);
    }
    println!("Completion rules\n{table}");
    println!("Available functions: {}", registry.keys().join(", "));
    Ok(())
}
