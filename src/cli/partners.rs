use comfy_table::{Cell, Table};

use crate::db::{account_id_by_code, get_connection, partner_id_by_name};
use crate::error::Result;
use crate::settings::get_db_path;

pub fn add(
    name: &str,
    label: Option<&str>,
    receivable: Option<&str>,
    payable: Option<&str>,
) -> Result<()> {
    let conn = get_connection(&get_db_path())?;
    let receivable_id = receivable.map(|c| account_id_by_code(&conn, c)).transpose()?;
    let payable_id = payable.map(|c| account_id_by_code(&conn, c)).transpose()?;
    conn.execute(
        "INSERT INTO partners (name, statement_label, receivable_account_id, payable_account_id) \
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![name, label, receivable_id, payable_id],
    )?;
    println!("Added partner: {name}");
    Ok(())
}

pub fn add_order(order: &str, partner: &str) -> Result<()> {
    let conn = get_connection(&get_db_path())?;
    let partner_id = partner_id_by_name(&conn, partner)?;
    conn.execute(
        "INSERT INTO sale_orders (name, partner_id) VALUES (?1, ?2)",
        rusqlite::params![order, partner_id],
    )?;
    println!("Added sale order {order} \u{2192} {partner}");
    Ok(())
}

pub fn add_invoice(number: &str, partner: &str) -> Result<()> {
    let conn = get_connection(&get_db_path())?;
    let partner_id = partner_id_by_name(&conn, partner)?;
    conn.execute(
        "INSERT INTO invoices (number, partner_id) VALUES (?1, ?2)",
        rusqlite::params![number, partner_id],
    )?;
    println!("Added invoice {number} \u{2192} {partner}");
    Ok(())
}

pub fn list() -> Result<()> {
    let conn = get_connection(&get_db_path())?;
    let mut stmt = conn.prepare(
        "SELECT p.id, p.name, p.statement_label, r.code, a.code FROM partners p \
         LEFT JOIN accounts r ON p.receivable_account_id = r.id \
         LEFT JOIN accounts a ON p.payable_account_id = a.id ORDER BY p.name",
    )?;
    let rows: Vec<(i64, String, Option<String>, Option<String>, Option<String>)> = stmt
        .query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Name", "Statement Label", "Receivable", "Payable"]);
    for (id, name, label, receivable, payable) in rows {
        table.add_row(vec![
            Cell::new(id),
            Cell::new(name),
            Cell::new(label.unwrap_or_default()),
            Cell::new(receivable.unwrap_or_default()),
            Cell::new(payable.unwrap_or_default()),
        ]);
    }
    println!("Partners\n{table}");
    Ok(())
}
