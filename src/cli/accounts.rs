use comfy_table::{Cell, Table};

use crate::db::{default_company_id, get_connection};
use crate::error::Result;
use crate::settings::get_db_path;

pub fn add(code: &str, name: Option<&str>) -> Result<()> {
    let conn = get_connection(&get_db_path())?;
    let company_id = default_company_id(&conn)?;
    conn.execute(
        "INSERT INTO accounts (code, name, company_id) VALUES (?1, ?2, ?3)",
        rusqlite::params![code, name.unwrap_or(code), company_id],
    )?;
    println!("Added account: {code}");
    Ok(())
}

pub fn list() -> Result<()> {
    let conn = get_connection(&get_db_path())?;
    let mut stmt = conn.prepare("SELECT id, code, name FROM accounts ORDER BY code")?;
    let rows: Vec<(i64, String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Code", "Name"]);
    for (id, code, name) in rows {
        table.add_row(vec![Cell::new(id), Cell::new(code), Cell::new(name)]);
    }
    println!("Accounts\n{table}");
    Ok(())
}
