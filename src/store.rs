use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::completion::{auto_complete_move, CompletionResult, RuleRegistry};
use crate::error::{ImportError, Result};
use crate::models::{Attachment, ImportProfile, Move, MoveLine, MoveVals, NewMoveLine};

/// Attachment to store alongside an imported move.
pub struct NewAttachment<'a> {
    pub move_id: i64,
    pub name: &'a str,
    pub file_name: &'a str,
    pub data: &'a [u8],
}

/// Writes performed while building a move. Every call goes through the
/// connection it is handed, so the caller owns the transaction boundary.
pub trait MoveStore {
    fn create_move(&self, conn: &Connection, vals: &MoveVals, journal_code: &str) -> Result<Move>;

    /// Insert many lines with one prepared statement.
    fn insert_lines(&self, conn: &Connection, lines: &[NewMoveLine]) -> Result<usize>;

    fn insert_line(&self, conn: &Connection, line: &NewMoveLine) -> Result<i64>;

    fn create_attachment(&self, conn: &Connection, attachment: &NewAttachment) -> Result<i64>;

    fn append_log(&self, conn: &Connection, move_id: i64, body: &str) -> Result<()>;

    fn auto_complete(
        &self,
        conn: &Connection,
        profile: &ImportProfile,
        registry: &RuleRegistry,
        move_id: i64,
    ) -> Result<CompletionResult>;
}

pub struct SqliteStore;

impl MoveStore for SqliteStore {
    fn create_move(&self, conn: &Connection, vals: &MoveVals, journal_code: &str) -> Result<Move> {
        let name = next_move_name(conn, vals.journal_id, journal_code, vals.date)?;
        conn.execute(
            "INSERT INTO moves (name, ref, journal_id, currency, date) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                name,
                vals.reference,
                vals.journal_id,
                vals.currency,
                vals.date.format("%Y-%m-%d").to_string()
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(move_id = id, name = %name, "Move created");
        get_move(conn, id)
    }

    fn insert_lines(&self, conn: &Connection, lines: &[NewMoveLine]) -> Result<usize> {
        let mut stmt = conn.prepare_cached(INSERT_LINE_SQL)?;
        for line in lines {
            execute_insert_line(&mut stmt, line)?;
        }
        Ok(lines.len())
    }

    fn insert_line(&self, conn: &Connection, line: &NewMoveLine) -> Result<i64> {
        execute_insert_line(&mut conn.prepare_cached(INSERT_LINE_SQL)?, line)?;
        Ok(conn.last_insert_rowid())
    }

    fn create_attachment(&self, conn: &Connection, attachment: &NewAttachment) -> Result<i64> {
        conn.execute(
            "INSERT INTO attachments (move_id, name, file_name, checksum, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                attachment.move_id,
                attachment.name,
                attachment.file_name,
                checksum(attachment.data),
                attachment.data
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn append_log(&self, conn: &Connection, move_id: i64, body: &str) -> Result<()> {
        append_log(conn, move_id, body)
    }

    fn auto_complete(
        &self,
        conn: &Connection,
        profile: &ImportProfile,
        registry: &RuleRegistry,
        move_id: i64,
    ) -> Result<CompletionResult> {
        auto_complete_move(conn, profile, registry, move_id)
    }
}

const INSERT_LINE_SQL: &str = "INSERT INTO move_lines (move_id, journal_id, company_id, currency, \
     company_currency, name, ref, transaction_ref, date, date_maturity, debit, credit, account_id, \
     partner_id, already_completed) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)";

fn execute_insert_line(stmt: &mut rusqlite::CachedStatement, line: &NewMoveLine) -> Result<()> {
    stmt.execute(rusqlite::params![
        line.move_id,
        line.journal_id,
        line.company_id,
        line.currency,
        line.company_currency,
        line.name,
        line.reference,
        line.transaction_ref,
        line.date.format("%Y-%m-%d").to_string(),
        line.date_maturity.format("%Y-%m-%d").to_string(),
        line.debit,
        line.credit,
        line.account_id,
        line.partner_id,
        line.already_completed,
    ])?;
    Ok(())
}

pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// `<journal code>/<year>/<sequence>`, sequence counted per journal and year.
pub fn next_move_name(conn: &Connection, journal_id: i64, code: &str, date: NaiveDate) -> Result<String> {
    let year = date.format("%Y").to_string();
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM moves WHERE journal_id = ?1 AND substr(date, 1, 4) = ?2",
        rusqlite::params![journal_id, year],
        |r| r.get(0),
    )?;
    Ok(format!("{code}/{year}/{:04}", count + 1))
}

pub fn append_log(conn: &Connection, move_id: i64, body: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO move_logs (move_id, body) VALUES (?1, ?2)",
        rusqlite::params![move_id, body],
    )?;
    Ok(())
}

fn parse_stored_date(raw: String) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_move(row: &rusqlite::Row) -> rusqlite::Result<Move> {
    Ok(Move {
        id: row.get(0)?,
        name: row.get(1)?,
        reference: row.get(2)?,
        journal_id: row.get(3)?,
        currency: row.get(4)?,
        date: parse_stored_date(row.get(5)?)?,
        created_at: row.get(6)?,
    })
}

const MOVE_COLUMNS: &str = "id, name, ref, journal_id, currency, date, created_at";

pub fn get_move(conn: &Connection, move_id: i64) -> Result<Move> {
    conn.query_row(
        &format!("SELECT {MOVE_COLUMNS} FROM moves WHERE id = ?1"),
        [move_id],
        row_to_move,
    )
    .optional()?
    .ok_or_else(|| ImportError::UnknownMove(move_id.to_string()))
}

pub fn get_move_by_name(conn: &Connection, name: &str) -> Result<Move> {
    conn.query_row(
        &format!("SELECT {MOVE_COLUMNS} FROM moves WHERE name = ?1"),
        [name],
        row_to_move,
    )
    .optional()?
    .ok_or_else(|| ImportError::UnknownMove(name.to_string()))
}

pub fn get_lines(conn: &Connection, move_id: i64) -> Result<Vec<MoveLine>> {
    let mut stmt = conn.prepare(
        "SELECT id, move_id, name, ref, transaction_ref, date, debit, credit, account_id, \
         partner_id, currency, already_completed FROM move_lines WHERE move_id = ?1 ORDER BY id",
    )?;
    let lines = stmt
        .query_map([move_id], |row| {
            Ok(MoveLine {
                id: row.get(0)?,
                move_id: row.get(1)?,
                name: row.get(2)?,
                reference: row.get(3)?,
                transaction_ref: row.get(4)?,
                date: parse_stored_date(row.get(5)?)?,
                debit: row.get(6)?,
                credit: row.get(7)?,
                account_id: row.get(8)?,
                partner_id: row.get(9)?,
                currency: row.get(10)?,
                already_completed: row.get(11)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(lines)
}

pub fn get_attachments(conn: &Connection, move_id: i64) -> Result<Vec<Attachment>> {
    let mut stmt = conn.prepare(
        "SELECT id, move_id, name, file_name, checksum, data FROM attachments WHERE move_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([move_id], |row| {
            Ok(Attachment {
                id: row.get(0)?,
                move_id: row.get(1)?,
                name: row.get(2)?,
                file_name: row.get(3)?,
                checksum: row.get(4)?,
                data: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_logs(conn: &Connection, move_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT body FROM move_logs WHERE move_id = ?1 ORDER BY id")?;
    let rows = stmt
        .query_map([move_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
