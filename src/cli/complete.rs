use colored::Colorize;

use crate::completion::{auto_complete_move, RuleRegistry};
use crate::db::get_connection;
use crate::error::{ImportError, Result};
use crate::profiles::load_profile;
use crate::settings::get_db_path;
use crate::store::get_move_by_name;

pub fn run(move_name: &str) -> Result<()> {
    let conn = get_connection(&get_db_path())?;
    let registry = RuleRegistry::with_builtins();
    let mv = get_move_by_name(&conn, move_name)?;
    let profile_name: String = conn
        .query_row("SELECT name FROM journals WHERE id = ?1", [mv.journal_id], |r| r.get(0))
        .map_err(|_| ImportError::UnknownProfile(mv.journal_id.to_string()))?;
    let profile = load_profile(&conn, &profile_name, &registry)?;

    if !profile.used_for_completion {
        println!("Profile {} is not used for completion.", profile.name);
        return Ok(());
    }

    let result = auto_complete_move(&conn, &profile, &registry, mv.id)?;
    println!(
        "{} completed, {} still open",
        result.completed.to_string().green(),
        if result.still_open > 0 {
            result.still_open.to_string().yellow()
        } else {
            result.still_open.to_string().normal()
        }
    );
    Ok(())
}
