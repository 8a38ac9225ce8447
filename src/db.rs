use std::path::Path;

use rusqlite::{Connection, OptionalExtension};

use crate::completion::BuiltinRule;
use crate::error::Result;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS companies (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    currency TEXT NOT NULL DEFAULT 'EUR'
);

CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    company_id INTEGER NOT NULL,
    FOREIGN KEY (company_id) REFERENCES companies(id)
);

CREATE TABLE IF NOT EXISTS partners (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    statement_label TEXT,
    receivable_account_id INTEGER,
    payable_account_id INTEGER,
    FOREIGN KEY (receivable_account_id) REFERENCES accounts(id),
    FOREIGN KEY (payable_account_id) REFERENCES accounts(id)
);

CREATE TABLE IF NOT EXISTS sale_orders (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    partner_id INTEGER NOT NULL,
    FOREIGN KEY (partner_id) REFERENCES partners(id)
);

CREATE TABLE IF NOT EXISTS invoices (
    id INTEGER PRIMARY KEY,
    number TEXT NOT NULL UNIQUE,
    partner_id INTEGER NOT NULL,
    FOREIGN KEY (partner_id) REFERENCES partners(id)
);

CREATE TABLE IF NOT EXISTS journals (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    code TEXT NOT NULL UNIQUE,
    company_id INTEGER NOT NULL,
    currency TEXT,
    import_type TEXT NOT NULL DEFAULT 'generic_csvxls_so',
    default_debit_account_id INTEGER,
    default_credit_account_id INTEGER,
    commission_account_id INTEGER,
    receivable_account_id INTEGER,
    partner_id INTEGER,
    used_for_import INTEGER DEFAULT 1,
    used_for_completion INTEGER DEFAULT 1,
    launch_import_completion INTEGER DEFAULT 0,
    FOREIGN KEY (company_id) REFERENCES companies(id),
    FOREIGN KEY (default_debit_account_id) REFERENCES accounts(id),
    FOREIGN KEY (default_credit_account_id) REFERENCES accounts(id),
    FOREIGN KEY (commission_account_id) REFERENCES accounts(id),
    FOREIGN KEY (receivable_account_id) REFERENCES accounts(id),
    FOREIGN KEY (partner_id) REFERENCES partners(id)
);

CREATE TABLE IF NOT EXISTS completion_rules (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    sequence INTEGER NOT NULL DEFAULT 10,
    function_to_call TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS journal_rules (
    journal_id INTEGER NOT NULL,
    rule_id INTEGER NOT NULL,
    PRIMARY KEY (journal_id, rule_id),
    FOREIGN KEY (journal_id) REFERENCES journals(id),
    FOREIGN KEY (rule_id) REFERENCES completion_rules(id)
);

CREATE TABLE IF NOT EXISTS moves (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    ref TEXT NOT NULL,
    journal_id INTEGER NOT NULL,
    currency TEXT NOT NULL,
    date TEXT NOT NULL,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (journal_id) REFERENCES journals(id)
);

CREATE TABLE IF NOT EXISTS move_lines (
    id INTEGER PRIMARY KEY,
    move_id INTEGER NOT NULL,
    journal_id INTEGER NOT NULL,
    company_id INTEGER NOT NULL,
    currency TEXT NOT NULL,
    company_currency TEXT NOT NULL,
    name TEXT NOT NULL,
    ref TEXT,
    transaction_ref TEXT,
    date TEXT NOT NULL,
    date_maturity TEXT NOT NULL,
    debit REAL NOT NULL DEFAULT 0,
    credit REAL NOT NULL DEFAULT 0,
    account_id INTEGER,
    partner_id INTEGER,
    already_completed INTEGER DEFAULT 0,
    FOREIGN KEY (move_id) REFERENCES moves(id) ON DELETE CASCADE,
    FOREIGN KEY (account_id) REFERENCES accounts(id),
    FOREIGN KEY (partner_id) REFERENCES partners(id)
);

CREATE TABLE IF NOT EXISTS attachments (
    id INTEGER PRIMARY KEY,
    move_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    file_name TEXT NOT NULL,
    checksum TEXT NOT NULL,
    data BLOB NOT NULL,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (move_id) REFERENCES moves(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS move_logs (
    id INTEGER PRIMARY KEY,
    move_id INTEGER NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (move_id) REFERENCES moves(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const DEFAULT_COMPANY: (&str, &str) = ("My Company", "EUR");

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let count: i64 = conn.query_row("SELECT count(*) FROM companies", [], |row| row.get(0))?;
    if count == 0 {
        conn.execute(
            "INSERT INTO companies (name, currency) VALUES (?1, ?2)",
            rusqlite::params![DEFAULT_COMPANY.0, DEFAULT_COMPANY.1],
        )?;
    }

    let count: i64 = conn.query_row("SELECT count(*) FROM completion_rules", [], |row| row.get(0))?;
    if count == 0 {
        for (i, rule) in BuiltinRule::ALL.iter().enumerate() {
            conn.execute(
                "INSERT INTO completion_rules (name, sequence, function_to_call) VALUES (?1, ?2, ?3)",
                rusqlite::params![rule.name(), (i as i64 + 1) * 10, rule.key()],
            )?;
        }
    }
    Ok(())
}

pub fn get_metadata(conn: &Connection, key: &str) -> Option<String> {
    conn.query_row("SELECT value FROM metadata WHERE key = ?1", [key], |r| r.get(0))
        .optional()
        .ok()
        .flatten()
}

pub fn set_metadata(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![key, value],
    )?;
    Ok(())
}

pub fn default_company_id(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT min(id) FROM companies", [], |r| r.get(0))?)
}

pub fn account_id_by_code(conn: &Connection, code: &str) -> Result<i64> {
    conn.query_row("SELECT id FROM accounts WHERE code = ?1", [code], |r| r.get(0))
        .optional()?
        .ok_or_else(|| crate::error::ImportError::UnknownAccount(code.to_string()))
}

pub fn partner_id_by_name(conn: &Connection, name: &str) -> Result<i64> {
    conn.query_row("SELECT id FROM partners WHERE name = ?1", [name], |r| r.get(0))
        .optional()?
        .ok_or_else(|| crate::error::ImportError::UnknownPartner(name.to_string()))
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub fn test_db() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = get_connection(&dir.path().join("test.db")).unwrap();
        init_db(&conn).unwrap();
        (dir, conn)
    }

    pub fn add_account(conn: &Connection, code: &str) -> i64 {
        conn.execute(
            "INSERT INTO accounts (code, name, company_id) VALUES (?1, ?1, 1)",
            [code],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    pub fn add_partner(
        conn: &Connection,
        name: &str,
        label: Option<&str>,
        receivable: Option<i64>,
        payable: Option<i64>,
    ) -> i64 {
        conn.execute(
            "INSERT INTO partners (name, statement_label, receivable_account_id, payable_account_id) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![name, label, receivable, payable],
        )
        .unwrap();
        conn.last_insert_rowid()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_init_db_creates_tables() {
        let (_dir, conn) = test_db();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        for expected in &[
            "companies", "accounts", "partners", "journals", "completion_rules",
            "journal_rules", "moves", "move_lines", "attachments", "move_logs",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing table: {expected}");
        }
    }

    #[test]
    fn test_init_db_is_idempotent() {
        let (_dir, conn) = test_db();
        init_db(&conn).unwrap();
        let companies: i64 = conn.query_row("SELECT count(*) FROM companies", [], |r| r.get(0)).unwrap();
        assert_eq!(companies, 1);
    }

    #[test]
    fn test_init_db_seeds_builtin_rules() {
        let (_dir, conn) = test_db();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM completion_rules", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count as usize, BuiltinRule::ALL.len());
    }

    #[test]
    fn test_metadata_roundtrip() {
        let (_dir, conn) = test_db();
        assert_eq!(get_metadata(&conn, "last_import"), None);
        set_metadata(&conn, "last_import", "2025-01-01").unwrap();
        set_metadata(&conn, "last_import", "2025-02-01").unwrap();
        assert_eq!(get_metadata(&conn, "last_import").as_deref(), Some("2025-02-01"));
    }

    #[test]
    fn test_lookup_by_code_and_name() {
        let (_dir, conn) = test_db();
        let acc = add_account(&conn, "512000");
        assert_eq!(account_id_by_code(&conn, "512000").unwrap(), acc);
        assert!(account_id_by_code(&conn, "999").is_err());
        let p = add_partner(&conn, "Acme", None, None, None);
        assert_eq!(partner_id_by_name(&conn, "Acme").unwrap(), p);
    }
}
