use chrono::NaiveDate;
use rusqlite::{Connection, Transaction};
use tracing::{debug, error, info};

use crate::completion::RuleRegistry;
use crate::error::{ImportError, Result};
use crate::models::{
    is_move_line_field, FieldValue, ImportProfile, LineVals, Move, MoveVals, NewMoveLine,
};
use crate::parser::{FileType, RowGroup};
use crate::store::{MoveStore, NewAttachment};

pub const COMMISSION_LINE_NAME: &str = "Commission line";
pub const COUNTERPART_LINE_NAME: &str = "Counterpart line";
pub const ATTACHMENT_NAME: &str = "statement file";

// ---------------------------------------------------------------------------
// Line defaults
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum LineDefault {
    Text(&'static str),
    Zero,
    MoveDate,
    False,
    Null,
}

/// Values given to a line field the parser left out.
const LINE_DEFAULTS: &[(&str, LineDefault)] = &[
    ("name", LineDefault::Text("/")),
    ("ref", LineDefault::Null),
    ("transaction_ref", LineDefault::Null),
    ("date", LineDefault::MoveDate),
    ("date_maturity", LineDefault::MoveDate),
    ("debit", LineDefault::Zero),
    ("credit", LineDefault::Zero),
    ("account_id", LineDefault::Null),
    ("partner_id", LineDefault::Null),
    ("already_completed", LineDefault::False),
];

pub fn apply_line_defaults(vals: &mut LineVals, move_date: NaiveDate) {
    for (field, default) in LINE_DEFAULTS {
        let missing = matches!(vals.get(*field), None | Some(FieldValue::Null));
        if !missing {
            continue;
        }
        let value = match default {
            LineDefault::Text(s) => FieldValue::Text(s.to_string()),
            LineDefault::Zero => FieldValue::Float(0.0),
            LineDefault::MoveDate => FieldValue::Date(move_date),
            LineDefault::False => FieldValue::Bool(false),
            LineDefault::Null => FieldValue::Null,
        };
        vals.insert(field.to_string(), value);
    }
}

/// Every key a row maps to must be a move line field.
pub fn check_columns(group: &RowGroup) -> Result<()> {
    for row in &group.result_row_list {
        let vals = group.get_move_line_vals(row);
        if let Some(col) = vals.keys().find(|k| !is_move_line_field(k)) {
            return Err(ImportError::UnknownColumn(col.clone()));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds one move per statement for a profile.
pub struct MoveBuilder<'a, S: MoveStore> {
    profile: &'a ImportProfile,
    registry: &'a RuleRegistry,
    store: &'a S,
}

impl<'a, S: MoveStore> MoveBuilder<'a, S> {
    pub fn new(profile: &'a ImportProfile, registry: &'a RuleRegistry, store: &'a S) -> Self {
        Self {
            profile,
            registry,
            store,
        }
    }

    /// Build and commit a move in its own transaction.
    pub fn build_move(
        &self,
        conn: &mut Connection,
        group: &RowGroup,
        file: &[u8],
        ftype: FileType,
    ) -> Result<Move> {
        let mut tx = conn.transaction()?;
        let mv = self.build_in(&mut tx, group, file, ftype)?;
        tx.commit()?;
        Ok(mv)
    }

    /// Build a move under a savepoint of `tx`. Input problems are reported
    /// before anything is written; any later failure rolls the savepoint
    /// back and comes out as a single `Build` error.
    pub fn build_in(
        &self,
        tx: &mut Transaction,
        group: &RowGroup,
        file: &[u8],
        ftype: FileType,
    ) -> Result<Move> {
        if !self.profile.used_for_import {
            return Err(ImportError::ProfileNotImportable(self.profile.name.clone()));
        }
        if group.result_row_list.is_empty() {
            return Err(ImportError::NothingToImport);
        }
        check_columns(group)?;

        let sp = tx.savepoint()?;
        match self.write_move(&sp, group, file, ftype) {
            Ok(mv) => {
                sp.commit()?;
                Ok(mv)
            }
            Err(err) => {
                drop(sp);
                error!(profile = %self.profile.name, kind = err.kind(), "Statement build rolled back: {err}");
                Err(err.into_build_failure())
            }
        }
    }

    fn write_move(
        &self,
        conn: &Connection,
        group: &RowGroup,
        file: &[u8],
        ftype: FileType,
    ) -> Result<Move> {
        let vals = self.prepare_move_vals(group);
        let mv = self.store.create_move(conn, &vals, &self.profile.code)?;

        let mut batch = Vec::with_capacity(group.result_row_list.len());
        for row in &group.result_row_list {
            let parser_vals = group.get_move_line_vals(row);
            let values = self.prepare_move_line_vals(parser_vals, &mv)?;
            batch.push(NewMoveLine::from_vals(&values)?);
        }
        let inserted = self.store.insert_lines(conn, &batch)?;
        info!(move_id = mv.id, lines = inserted, "Statement lines inserted");

        self.write_extra_move_lines(conn, group, &mv)?;

        let file_name = format!(
            "{}.{}",
            chrono::Local::now().date_naive().format("%Y-%m-%d"),
            ftype.extension()
        );
        self.store.create_attachment(
            conn,
            &NewAttachment {
                move_id: mv.id,
                name: ATTACHMENT_NAME,
                file_name: &file_name,
                data: file,
            },
        )?;

        if self.profile.launch_import_completion {
            let result = self.store.auto_complete(conn, self.profile, self.registry, mv.id)?;
            info!(move_id = mv.id, completed = result.completed, "Completion launched after import");
        }

        self.store.append_log(
            conn,
            mv.id,
            &format!(
                "Move {} have been imported with {} lines.",
                mv.name,
                group.result_row_list.len()
            ),
        )?;
        Ok(mv)
    }

    pub fn prepare_move_vals(&self, group: &RowGroup) -> MoveVals {
        let header = group.get_move_vals();
        MoveVals {
            journal_id: self.profile.id,
            currency: self.profile.currency.clone(),
            reference: header.reference,
            date: header.date,
        }
    }

    /// Attach profile identifiers to the parser values, pick the account
    /// from the amount sign and fill the remaining defaults.
    pub fn prepare_move_line_vals(&self, mut values: LineVals, mv: &Move) -> Result<LineVals> {
        let profile = self.profile;
        values.insert("company_id".into(), FieldValue::Int(profile.company_id));
        values.insert("currency".into(), FieldValue::Text(profile.currency.clone()));
        values.insert(
            "company_currency".into(),
            FieldValue::Text(profile.company_currency.clone()),
        );
        values.insert("journal_id".into(), FieldValue::Int(profile.id));
        values.insert("move_id".into(), FieldValue::Int(mv.id));

        let completed = values
            .get("already_completed")
            .map(|v| v.as_bool("already_completed"))
            .transpose()?
            .unwrap_or(false);
        let has_account = values
            .get("account_id")
            .map(|v| v.as_opt_i64("account_id"))
            .transpose()?
            .flatten()
            .is_some();
        if !(completed && has_account) {
            let credit = values
                .get("credit")
                .map(|v| v.as_f64("credit"))
                .transpose()?
                .unwrap_or(0.0);
            let (account, side) = if credit > 0.0 {
                (profile.default_credit_account_id, "credit")
            } else {
                (profile.default_debit_account_id, "debit")
            };
            let account = account.ok_or_else(|| ImportError::MissingDefaultAccount {
                profile: profile.name.clone(),
                side,
            })?;
            values.insert("account_id".into(), FieldValue::Int(account));
        }

        apply_line_defaults(&mut values, mv.date);
        Ok(values)
    }

    fn synthetic_line(&self, mv: &Move, name: &str, debit: f64, account_id: Option<i64>) -> NewMoveLine {
        NewMoveLine {
            move_id: mv.id,
            journal_id: self.profile.id,
            company_id: self.profile.company_id,
            currency: self.profile.currency.clone(),
            company_currency: self.profile.company_currency.clone(),
            name: name.to_string(),
            reference: None,
            transaction_ref: None,
            date: mv.date,
            date_maturity: mv.date,
            debit,
            credit: 0.0,
            account_id,
            partner_id: self.profile.partner_id,
            already_completed: true,
        }
    }

    /// Commission and counterpart lines computed from the statement totals.
    pub fn write_extra_move_lines(&self, conn: &Connection, group: &RowGroup, mv: &Move) -> Result<()> {
        let total_commission = group.column_total("commission_amount");
        let total_amount = group.column_total("amount") + total_commission;

        if total_commission < 0.0 {
            let line = self.synthetic_line(
                mv,
                COMMISSION_LINE_NAME,
                -total_commission,
                self.profile.commission_account_id,
            );
            self.store.insert_line(conn, &line)?;
            debug!(move_id = mv.id, debit = line.debit, "Commission line added");
        }
        if total_amount > 0.0 {
            let line = self.synthetic_line(
                mv,
                COUNTERPART_LINE_NAME,
                total_amount,
                self.profile.receivable_account_id,
            );
            self.store.insert_line(conn, &line)?;
            debug!(move_id = mv.id, debit = line.debit, "Counterpart line added");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::completion::CompletionResult;
    use crate::db::test_support::{add_partner, test_db};
    use crate::models::{ImportType, MoveLine, ParsedRow};
    use crate::profiles::test_support::{setup_accounts, ProfileAccounts};
    use crate::store::{get_attachments, get_lines, get_logs, SqliteStore};

    fn profile(accounts: &ProfileAccounts) -> ImportProfile {
        ImportProfile {
            id: 1,
            name: "Bank".to_string(),
            code: "BNK".to_string(),
            company_id: 1,
            currency: "EUR".to_string(),
            company_currency: "EUR".to_string(),
            import_type: ImportType::GenericCsvXlsSo,
            default_debit_account_id: Some(accounts.debit),
            default_credit_account_id: Some(accounts.credit),
            commission_account_id: Some(accounts.commission),
            receivable_account_id: Some(accounts.receivable),
            partner_id: None,
            used_for_import: true,
            used_for_completion: true,
            launch_import_completion: false,
            rules: Vec::new(),
        }
    }

    fn setup(conn: &Connection) -> ImportProfile {
        let accounts = setup_accounts(conn);
        conn.execute(
            "INSERT INTO journals (id, name, code, company_id) VALUES (1, 'Bank', 'BNK', 1)",
            [],
        )
        .unwrap();
        profile(&accounts)
    }

    fn row(date: &str, label: &str, amount: f64, commission: f64) -> ParsedRow {
        let mut row = ParsedRow::new();
        row.insert(
            "date".into(),
            FieldValue::Date(NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap()),
        );
        row.insert("label".into(), FieldValue::Text(label.into()));
        row.insert("amount".into(), FieldValue::Float(amount));
        row.insert("commission_amount".into(), FieldValue::Float(commission));
        row
    }

    fn group(rows: Vec<ParsedRow>) -> RowGroup {
        RowGroup {
            result_row_list: rows,
            move_ref: Some("statement-jan".to_string()),
        }
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    fn synthetic(lines: &[MoveLine], name: &str) -> Vec<MoveLine> {
        lines.iter().filter(|l| l.name == name).cloned().collect()
    }

    #[test]
    fn test_commission_and_counterpart_lines() {
        let (_dir, mut conn) = test_db();
        let p = setup(&conn);
        let registry = RuleRegistry::with_builtins();
        let g = group(vec![
            row("2025-01-10", "A", 100.0, -5.0),
            row("2025-01-11", "B", 50.0, -3.0),
            row("2025-01-12", "C", 30.0, 2.0),
        ]);
        let mv = MoveBuilder::new(&p, &registry, &SqliteStore)
            .build_move(&mut conn, &g, b"raw", FileType::Csv)
            .unwrap();

        assert_eq!(mv.name, "BNK/2025/0001");
        assert_eq!(mv.reference, "statement-jan");
        assert_eq!(mv.date, NaiveDate::from_ymd_opt(2025, 1, 12).unwrap());

        let lines = get_lines(&conn, mv.id).unwrap();
        assert_eq!(lines.len(), 3 + 2);

        let commission = synthetic(&lines, COMMISSION_LINE_NAME);
        assert_eq!(commission.len(), 1);
        assert_eq!(commission[0].debit, 6.0);
        assert_eq!(commission[0].account_id, p.commission_account_id);
        assert!(commission[0].already_completed);

        let counterpart = synthetic(&lines, COUNTERPART_LINE_NAME);
        assert_eq!(counterpart.len(), 1);
        assert_eq!(counterpart[0].debit, 174.0);
        assert_eq!(counterpart[0].account_id, p.receivable_account_id);
    }

    #[test]
    fn test_counterpart_only_when_total_positive() {
        let (_dir, mut conn) = test_db();
        let p = setup(&conn);
        let registry = RuleRegistry::with_builtins();
        let g = group(vec![
            row("2025-01-10", "In", 100.0, 0.0),
            row("2025-01-11", "Out", -20.0, 0.0),
        ]);
        let mv = MoveBuilder::new(&p, &registry, &SqliteStore)
            .build_move(&mut conn, &g, b"raw", FileType::Csv)
            .unwrap();
        let lines = get_lines(&conn, mv.id).unwrap();
        assert_eq!(lines.len(), 2 + 1);
        assert!(synthetic(&lines, COMMISSION_LINE_NAME).is_empty());
        assert_eq!(synthetic(&lines, COUNTERPART_LINE_NAME)[0].debit, 80.0);
    }

    #[test]
    fn test_no_synthetic_lines_for_negative_total() {
        let (_dir, mut conn) = test_db();
        let p = setup(&conn);
        let registry = RuleRegistry::with_builtins();
        let g = group(vec![row("2025-01-10", "Out", -100.0, 0.0)]);
        let mv = MoveBuilder::new(&p, &registry, &SqliteStore)
            .build_move(&mut conn, &g, b"raw", FileType::Csv)
            .unwrap();
        assert_eq!(get_lines(&conn, mv.id).unwrap().len(), 1);
    }

    #[test]
    fn test_synthetic_lines_carry_profile_partner() {
        let (_dir, mut conn) = test_db();
        let mut p = setup(&conn);
        p.partner_id = Some(add_partner(&conn, "Payment Office", None, None, None));
        let registry = RuleRegistry::with_builtins();
        let g = group(vec![row("2025-01-10", "In", 100.0, -1.0)]);
        let mv = MoveBuilder::new(&p, &registry, &SqliteStore)
            .build_move(&mut conn, &g, b"raw", FileType::Csv)
            .unwrap();
        let lines = get_lines(&conn, mv.id).unwrap();
        for name in [COMMISSION_LINE_NAME, COUNTERPART_LINE_NAME] {
            assert_eq!(synthetic(&lines, name)[0].partner_id, p.partner_id);
        }
    }

    #[test]
    fn test_account_resolved_from_amount_sign() {
        let (_dir, mut conn) = test_db();
        let p = setup(&conn);
        let registry = RuleRegistry::with_builtins();
        let g = group(vec![
            row("2025-01-10", "Received", 10.0, 0.0),
            row("2025-01-10", "Paid", -10.0, 0.0),
        ]);
        let mv = MoveBuilder::new(&p, &registry, &SqliteStore)
            .build_move(&mut conn, &g, b"raw", FileType::Csv)
            .unwrap();
        let lines = get_lines(&conn, mv.id).unwrap();
        let received = lines.iter().find(|l| l.name == "Received").unwrap();
        let paid = lines.iter().find(|l| l.name == "Paid").unwrap();
        assert_eq!(received.credit, 10.0);
        assert_eq!(received.account_id, p.default_credit_account_id);
        assert_eq!(paid.debit, 10.0);
        assert_eq!(paid.account_id, p.default_debit_account_id);
        assert!(!received.already_completed);
    }

    #[test]
    fn test_attachment_and_log_written() {
        let (_dir, mut conn) = test_db();
        let p = setup(&conn);
        let registry = RuleRegistry::with_builtins();
        let g = group(vec![row("2025-01-10", "In", 10.0, 0.0), row("2025-01-11", "In", 5.0, 0.0)]);
        let mv = MoveBuilder::new(&p, &registry, &SqliteStore)
            .build_move(&mut conn, &g, b"date,amount", FileType::Csv)
            .unwrap();

        let attachments = get_attachments(&conn, mv.id).unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].name, ATTACHMENT_NAME);
        assert_eq!(attachments[0].data, b"date,amount");
        let today = chrono::Local::now().date_naive().format("%Y-%m-%d").to_string();
        assert_eq!(attachments[0].file_name, format!("{today}.csv"));

        let logs = get_logs(&conn, mv.id).unwrap();
        assert_eq!(logs, vec![format!("Move {} have been imported with 2 lines.", mv.name)]);
    }

    #[test]
    fn test_empty_rows_create_nothing() {
        let (_dir, mut conn) = test_db();
        let p = setup(&conn);
        let registry = RuleRegistry::with_builtins();
        let err = MoveBuilder::new(&p, &registry, &SqliteStore)
            .build_move(&mut conn, &group(Vec::new()), b"", FileType::Csv)
            .unwrap_err();
        assert!(matches!(err, ImportError::NothingToImport));
        assert_eq!(count(&conn, "moves"), 0);
    }

    #[test]
    fn test_unknown_column_rejected_before_move() {
        let (_dir, mut conn) = test_db();
        let p = setup(&conn);
        let registry = RuleRegistry::with_builtins();
        let mut bad = row("2025-01-11", "B", 5.0, 0.0);
        bad.insert("customer_note".into(), FieldValue::Text("hi".into()));
        // The offending column is on the second row.
        let g = group(vec![row("2025-01-10", "A", 10.0, 0.0), bad]);
        let err = MoveBuilder::new(&p, &registry, &SqliteStore)
            .build_move(&mut conn, &g, b"", FileType::Csv)
            .unwrap_err();
        assert!(matches!(err, ImportError::UnknownColumn(ref c) if c == "customer_note"));
        assert!(err.is_user_input());
        assert_eq!(count(&conn, "moves"), 0);
    }

    #[test]
    fn test_profile_not_used_for_import() {
        let (_dir, mut conn) = test_db();
        let mut p = setup(&conn);
        p.used_for_import = false;
        let registry = RuleRegistry::with_builtins();
        let err = MoveBuilder::new(&p, &registry, &SqliteStore)
            .build_move(&mut conn, &group(vec![row("2025-01-10", "A", 1.0, 0.0)]), b"", FileType::Csv)
            .unwrap_err();
        assert!(matches!(err, ImportError::ProfileNotImportable(_)));
    }

    #[test]
    fn test_missing_default_account_is_wrapped_and_rolled_back() {
        let (_dir, mut conn) = test_db();
        let mut p = setup(&conn);
        p.default_credit_account_id = None;
        let registry = RuleRegistry::with_builtins();
        let err = MoveBuilder::new(&p, &registry, &SqliteStore)
            .build_move(&mut conn, &group(vec![row("2025-01-10", "A", 1.0, 0.0)]), b"", FileType::Csv)
            .unwrap_err();
        assert!(matches!(err, ImportError::Build { kind: "MissingDefaultAccount", .. }));
        assert_eq!(count(&conn, "moves"), 0);
    }

    #[test]
    fn test_launch_completion_after_import() {
        let (_dir, mut conn) = test_db();
        let mut p = setup(&conn);
        let partner = add_partner(&conn, "Acme", None, Some(p.receivable_account_id.unwrap()), None);
        p.launch_import_completion = true;
        p.rules = vec![crate::models::CompletionRule {
            id: 1,
            name: "From line label (based on partner name)".into(),
            sequence: 10,
            function_to_call: "get_from_label_and_partner_name".into(),
        }];
        let registry = RuleRegistry::with_builtins();
        let g = group(vec![
            row("2025-01-10", "Transfer ACME", 10.0, 0.0),
            row("2025-01-10", "Unknown sender", 5.0, 0.0),
        ]);
        let mv = MoveBuilder::new(&p, &registry, &SqliteStore)
            .build_move(&mut conn, &g, b"", FileType::Csv)
            .unwrap();
        let lines = get_lines(&conn, mv.id).unwrap();
        let acme = lines.iter().find(|l| l.name == "Transfer ACME").unwrap();
        assert_eq!(acme.partner_id, Some(partner));
        assert!(acme.already_completed);
        let unknown = lines.iter().find(|l| l.name == "Unknown sender").unwrap();
        assert!(!unknown.already_completed);
        assert_eq!(get_logs(&conn, mv.id).unwrap().len(), 2);
    }

    #[test]
    fn test_apply_line_defaults_fills_only_missing() {
        let date = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap();
        let mut vals = LineVals::new();
        vals.insert("name".into(), FieldValue::Text("Payment".into()));
        vals.insert("debit".into(), FieldValue::Null);
        apply_line_defaults(&mut vals, date);
        assert_eq!(vals["name"], FieldValue::Text("Payment".into()));
        assert_eq!(vals["debit"], FieldValue::Float(0.0));
        assert_eq!(vals["date_maturity"], FieldValue::Date(date));
        assert_eq!(vals["already_completed"], FieldValue::Bool(false));
    }

    // -----------------------------------------------------------------------
    // Failure injection
    // -----------------------------------------------------------------------

    #[derive(Clone, Copy, PartialEq, Debug)]
    enum Step {
        CreateMove,
        InsertLines,
        InsertLine,
        Attachment,
        Completion,
        Log,
    }

    struct FailingStore {
        fail_at: Step,
        reached: Cell<bool>,
    }

    impl FailingStore {
        fn check(&self, step: Step) -> Result<()> {
            if step == self.fail_at {
                self.reached.set(true);
                return Err(ImportError::Other(format!("injected failure at {step:?}")));
            }
            Ok(())
        }
    }

    impl MoveStore for FailingStore {
        fn create_move(&self, conn: &Connection, vals: &MoveVals, code: &str) -> Result<Move> {
            self.check(Step::CreateMove)?;
            SqliteStore.create_move(conn, vals, code)
        }

        fn insert_lines(&self, conn: &Connection, lines: &[NewMoveLine]) -> Result<usize> {
            // Write first so there is something to roll back.
            let n = SqliteStore.insert_lines(conn, lines)?;
            self.check(Step::InsertLines)?;
            Ok(n)
        }

        fn insert_line(&self, conn: &Connection, line: &NewMoveLine) -> Result<i64> {
            self.check(Step::InsertLine)?;
            SqliteStore.insert_line(conn, line)
        }

        fn create_attachment(&self, conn: &Connection, attachment: &NewAttachment) -> Result<i64> {
            self.check(Step::Attachment)?;
            SqliteStore.create_attachment(conn, attachment)
        }

        fn append_log(&self, conn: &Connection, move_id: i64, body: &str) -> Result<()> {
            self.check(Step::Log)?;
            SqliteStore.append_log(conn, move_id, body)
        }

        fn auto_complete(
            &self,
            conn: &Connection,
            profile: &ImportProfile,
            registry: &RuleRegistry,
            move_id: i64,
        ) -> Result<CompletionResult> {
            self.check(Step::Completion)?;
            SqliteStore.auto_complete(conn, profile, registry, move_id)
        }
    }

    #[test]
    fn test_failure_at_each_step_leaves_no_records() {
        for step in [
            Step::CreateMove,
            Step::InsertLines,
            Step::InsertLine,
            Step::Attachment,
            Step::Completion,
            Step::Log,
        ] {
            let (_dir, mut conn) = test_db();
            let mut p = setup(&conn);
            p.launch_import_completion = true;
            let registry = RuleRegistry::with_builtins();
            let store = FailingStore { fail_at: step, reached: Cell::new(false) };
            let g = group(vec![row("2025-01-10", "In", 100.0, -2.0)]);

            let err = MoveBuilder::new(&p, &registry, &store)
                .build_move(&mut conn, &g, b"raw", FileType::Csv)
                .unwrap_err();

            assert!(store.reached.get(), "step {step:?} was never reached");
            match &err {
                ImportError::Build { kind, description, .. } => {
                    assert_eq!(*kind, "Other");
                    assert!(description.contains(&format!("{step:?}")));
                }
                other => panic!("expected build failure at {step:?}, got {other:?}"),
            }
            for table in ["moves", "move_lines", "attachments", "move_logs"] {
                assert_eq!(count(&conn, table), 0, "{table} not rolled back at {step:?}");
            }
        }
    }
}
