use std::path::PathBuf;

use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::completion::RuleRegistry;
use crate::db::get_connection;
use crate::error::Result;
use crate::fmt::money;
use crate::importer::import_file;
use crate::parser::FileType;
use crate::profiles::load_profile;
use crate::settings::{get_db_path, load_settings};
use crate::store::{get_lines, SqliteStore};

pub fn run(file: &str, profile_name: &str, file_type: Option<&str>) -> Result<()> {
    let file_path = PathBuf::from(file);
    let mut conn = get_connection(&get_db_path())?;
    let registry = RuleRegistry::with_builtins();
    let profile = load_profile(&conn, profile_name, &registry)?;

    let ftype = match file_type {
        Some(key) => Some(FileType::from_key(key)?),
        None if file_path.extension().is_none() => {
            Some(FileType::from_key(&load_settings().default_file_type)?)
        }
        None => None,
    };

    let moves = import_file(&mut conn, &profile, &registry, &SqliteStore, &file_path, ftype)?;

    let mut table = Table::new();
    table.set_header(vec!["Move", "Reference", "Date", "Lines", "Received", "Paid", "Open"]);
    for mv in &moves {
        let lines = get_lines(&conn, mv.id)?;
        let received: f64 = lines.iter().map(|l| l.credit).sum();
        let paid: f64 = lines.iter().map(|l| l.debit).sum();
        let open = lines.iter().filter(|l| !l.already_completed).count();
        table.add_row(vec![
            Cell::new(&mv.name),
            Cell::new(&mv.reference),
            Cell::new(mv.date.format("%Y-%m-%d")),
            Cell::new(lines.len()),
            Cell::new(money(received, &mv.currency)),
            Cell::new(money(paid, &mv.currency)),
            Cell::new(if open > 0 { open.to_string().yellow() } else { open.to_string().green() }),
        ]);
    }
    println!("{} imported\n{table}", format!("{} move(s)", moves.len()).green().bold());
    Ok(())
}
