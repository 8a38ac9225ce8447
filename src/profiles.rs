use rusqlite::{Connection, OptionalExtension};

use crate::completion::RuleRegistry;
use crate::error::{ImportError, Result};
use crate::models::{CompletionRule, ImportProfile, ImportType};

/// Values for a new import profile (journal).
#[derive(Debug, Clone)]
pub struct NewProfile {
    pub name: String,
    pub code: String,
    pub currency: Option<String>,
    pub import_type: ImportType,
    pub default_debit_account_id: Option<i64>,
    pub default_credit_account_id: Option<i64>,
    pub commission_account_id: Option<i64>,
    pub receivable_account_id: Option<i64>,
    pub partner_id: Option<i64>,
    pub used_for_completion: bool,
    pub launch_import_completion: bool,
    /// Function keys of the completion rules to attach.
    pub rule_functions: Vec<String>,
}

/// Journal codes prefix move names, so two profiles may not share one.
pub fn create_profile(conn: &Connection, registry: &RuleRegistry, profile: &NewProfile) -> Result<i64> {
    let company_id = crate::db::default_company_id(conn)?;
    let taken: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM journals WHERE code = ?1)",
        [&profile.code],
        |r| r.get(0),
    )?;
    if taken {
        return Err(ImportError::DuplicateProfileCode(profile.code.clone()));
    }
    let mut rule_ids = Vec::new();
    for key in &profile.rule_functions {
        if !registry.contains(key) {
            return Err(ImportError::UnknownRule(key.clone()));
        }
        let id: i64 = conn
            .query_row(
                "SELECT id FROM completion_rules WHERE function_to_call = ?1 ORDER BY sequence LIMIT 1",
                [key],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| ImportError::UnknownRule(key.clone()))?;
        rule_ids.push(id);
    }

    conn.execute(
        "INSERT INTO journals (name, code, company_id, currency, import_type, default_debit_account_id, \
         default_credit_account_id, commission_account_id, receivable_account_id, partner_id, \
         used_for_import, used_for_completion, launch_import_completion) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?12)",
        rusqlite::params![
            profile.name,
            profile.code,
            company_id,
            profile.currency,
            profile.import_type.key(),
            profile.default_debit_account_id,
            profile.default_credit_account_id,
            profile.commission_account_id,
            profile.receivable_account_id,
            profile.partner_id,
            profile.used_for_completion,
            profile.launch_import_completion,
        ],
    )?;
    let journal_id = conn.last_insert_rowid();
    for rule_id in rule_ids {
        conn.execute(
            "INSERT OR IGNORE INTO journal_rules (journal_id, rule_id) VALUES (?1, ?2)",
            [journal_id, rule_id],
        )?;
    }
    Ok(journal_id)
}

/// Load a profile by name. Every attached rule must be known to the
/// registry, so a misconfigured profile fails here and never mid-import.
pub fn load_profile(conn: &Connection, name: &str, registry: &RuleRegistry) -> Result<ImportProfile> {
    let row = conn
        .query_row(
            "SELECT j.id, j.name, j.code, j.company_id, COALESCE(j.currency, c.currency), c.currency, \
             j.import_type, j.default_debit_account_id, j.default_credit_account_id, \
             j.commission_account_id, j.receivable_account_id, j.partner_id, \
             j.used_for_import, j.used_for_completion, j.launch_import_completion \
             FROM journals j JOIN companies c ON j.company_id = c.id WHERE j.name = ?1",
            [name],
            |row| {
                Ok((
                    (
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ),
                    (
                        row.get::<_, Option<i64>>(7)?,
                        row.get::<_, Option<i64>>(8)?,
                        row.get::<_, Option<i64>>(9)?,
                        row.get::<_, Option<i64>>(10)?,
                        row.get::<_, Option<i64>>(11)?,
                    ),
                    (
                        row.get::<_, bool>(12)?,
                        row.get::<_, bool>(13)?,
                        row.get::<_, bool>(14)?,
                    ),
                ))
            },
        )
        .optional()?
        .ok_or_else(|| ImportError::UnknownProfile(name.to_string()))?;

    let ((id, name, code, company_id, currency, company_currency, import_type), accounts, flags) = row;
    let (debit, credit, commission, receivable, partner_id) = accounts;
    let (used_for_import, used_for_completion, launch_import_completion) = flags;

    let rules = get_rules(conn, id)?;
    registry.validate(&rules)?;

    Ok(ImportProfile {
        id,
        name,
        code,
        company_id,
        currency,
        company_currency,
        import_type: ImportType::from_key(&import_type)?,
        default_debit_account_id: debit,
        default_credit_account_id: credit,
        commission_account_id: commission,
        receivable_account_id: receivable,
        partner_id,
        used_for_import,
        used_for_completion,
        launch_import_completion,
        rules,
    })
}

/// Rules attached to a journal, in sequence order.
pub fn get_rules(conn: &Connection, journal_id: i64) -> Result<Vec<CompletionRule>> {
    let mut stmt = conn.prepare(
        "SELECT r.id, r.name, r.sequence, r.function_to_call FROM completion_rules r \
         JOIN journal_rules jr ON jr.rule_id = r.id \
         WHERE jr.journal_id = ?1 ORDER BY r.sequence, r.id",
    )?;
    let rules = stmt
        .query_map([journal_id], |row| {
            Ok(CompletionRule {
                id: row.get(0)?,
                name: row.get(1)?,
                sequence: row.get(2)?,
                function_to_call: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rules)
}

pub struct ProfileSummary {
    pub name: String,
    pub code: String,
    pub import_type: String,
    pub rule_count: i64,
    pub launch_import_completion: bool,
}

pub fn list_profiles(conn: &Connection) -> Result<Vec<ProfileSummary>> {
    let mut stmt = conn.prepare(
        "SELECT j.name, j.code, j.import_type, \
         (SELECT count(*) FROM journal_rules jr WHERE jr.journal_id = j.id), j.launch_import_completion \
         FROM journals j ORDER BY j.name",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ProfileSummary {
                name: row.get(0)?,
                code: row.get(1)?,
                import_type: row.get(2)?,
                rule_count: row.get(3)?,
                launch_import_completion: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::db::test_support::add_account;

    pub struct ProfileAccounts {
        pub debit: i64,
        pub credit: i64,
        pub commission: i64,
        pub receivable: i64,
    }

    pub fn new_profile(name: &str, accounts: &ProfileAccounts) -> NewProfile {
        NewProfile {
            name: name.to_string(),
            code: "BNK".to_string(),
            currency: None,
            import_type: ImportType::GenericCsvXlsSo,
            default_debit_account_id: Some(accounts.debit),
            default_credit_account_id: Some(accounts.credit),
            commission_account_id: Some(accounts.commission),
            receivable_account_id: Some(accounts.receivable),
            partner_id: None,
            used_for_completion: true,
            launch_import_completion: false,
            rule_functions: Vec::new(),
        }
    }

    pub fn setup_accounts(conn: &Connection) -> ProfileAccounts {
        ProfileAccounts {
            debit: add_account(conn, "512000"),
            credit: add_account(conn, "512100"),
            commission: add_account(conn, "627000"),
            receivable: add_account(conn, "411000"),
        }
    }
}
