use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::error::{ImportError, Result};

/// Parser selection for a profile. Only one parser ships today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportType {
    GenericCsvXlsSo,
}

impl ImportType {
    pub fn key(&self) -> &'static str {
        match self {
            Self::GenericCsvXlsSo => "generic_csvxls_so",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::GenericCsvXlsSo => "Generic .csv/.xls based on SO Name",
        }
    }

    pub fn from_key(key: &str) -> Result<Self> {
        ALL_IMPORT_TYPES
            .iter()
            .find(|t| t.key() == key)
            .copied()
            .ok_or_else(|| ImportError::UnknownImportType(key.to_string()))
    }
}

pub const ALL_IMPORT_TYPES: &[ImportType] = &[ImportType::GenericCsvXlsSo];

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRule {
    pub id: i64,
    pub name: String,
    pub sequence: i64,
    pub function_to_call: String,
}

/// Import configuration of one journal. Read-only while importing.
#[derive(Debug, Clone)]
pub struct ImportProfile {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub company_id: i64,
    pub currency: String,
    pub company_currency: String,
    pub import_type: ImportType,
    pub default_debit_account_id: Option<i64>,
    pub default_credit_account_id: Option<i64>,
    pub commission_account_id: Option<i64>,
    pub receivable_account_id: Option<i64>,
    pub partner_id: Option<i64>,
    pub used_for_import: bool,
    pub used_for_completion: bool,
    pub launch_import_completion: bool,
    /// Sorted by sequence.
    pub rules: Vec<CompletionRule>,
}

#[derive(Debug, Clone)]
pub struct Move {
    pub id: i64,
    pub name: String,
    pub reference: String,
    pub journal_id: i64,
    pub currency: String,
    pub date: NaiveDate,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct MoveLine {
    pub id: i64,
    pub move_id: i64,
    pub name: String,
    pub reference: Option<String>,
    pub transaction_ref: Option<String>,
    pub date: NaiveDate,
    pub debit: f64,
    pub credit: f64,
    pub account_id: Option<i64>,
    pub partner_id: Option<i64>,
    pub currency: String,
    pub already_completed: bool,
}

impl MoveLine {
    /// Signed amount: positive for money received.
    pub fn amount(&self) -> f64 {
        self.credit - self.debit
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Attachment {
    pub id: i64,
    pub move_id: i64,
    pub name: String,
    pub file_name: String,
    pub checksum: String,
    pub data: Vec<u8>,
}

/// A single value produced by the parser or the line mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl FieldValue {
    pub fn as_f64(&self, field: &str) -> Result<f64> {
        match self {
            Self::Null => Ok(0.0),
            Self::Float(f) => Ok(*f),
            Self::Int(i) => Ok(*i as f64),
            Self::Text(s) => s.trim().parse().map_err(|_| invalid(field, s)),
            other => Err(invalid(field, &format!("{other:?}"))),
        }
    }

    pub fn as_opt_i64(&self, field: &str) -> Result<Option<i64>> {
        match self {
            Self::Null => Ok(None),
            Self::Int(i) => Ok(Some(*i)),
            Self::Text(s) if s.trim().is_empty() => Ok(None),
            Self::Text(s) => s.trim().parse().map(Some).map_err(|_| invalid(field, s)),
            other => Err(invalid(field, &format!("{other:?}"))),
        }
    }

    pub fn as_opt_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(s) => Some(s.clone()),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }

    pub fn as_bool(&self, field: &str) -> Result<bool> {
        match self {
            Self::Null => Ok(false),
            Self::Bool(b) => Ok(*b),
            Self::Int(i) => Ok(*i != 0),
            Self::Text(s) => match s.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" | "" => Ok(false),
                _ => Err(invalid(field, s)),
            },
            other => Err(invalid(field, &format!("{other:?}"))),
        }
    }

    pub fn as_date(&self, field: &str) -> Result<NaiveDate> {
        match self {
            Self::Date(d) => Ok(*d),
            Self::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map_err(|_| invalid(field, s)),
            other => Err(invalid(field, &format!("{other:?}"))),
        }
    }
}

fn invalid(field: &str, value: &str) -> ImportError {
    ImportError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
}

/// One parsed row: column name to cast value.
pub type ParsedRow = BTreeMap<String, FieldValue>;

/// Field values of a move line before insertion.
pub type LineVals = BTreeMap<String, FieldValue>;

/// Every field a move line accepts. Keys outside this set are rejected
/// before a move is created.
pub const MOVE_LINE_FIELDS: &[&str] = &[
    "name",
    "ref",
    "transaction_ref",
    "date",
    "date_maturity",
    "debit",
    "credit",
    "account_id",
    "partner_id",
    "already_completed",
    "journal_id",
    "company_id",
    "currency",
    "company_currency",
    "move_id",
];

pub fn is_move_line_field(key: &str) -> bool {
    MOVE_LINE_FIELDS.contains(&key)
}

/// Header values for a new move.
#[derive(Debug, Clone)]
pub struct MoveVals {
    pub journal_id: i64,
    pub currency: String,
    pub reference: String,
    pub date: NaiveDate,
}

/// Fully normalized move line, ready for the bulk insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMoveLine {
    pub move_id: i64,
    pub journal_id: i64,
    pub company_id: i64,
    pub currency: String,
    pub company_currency: String,
    pub name: String,
    pub reference: Option<String>,
    pub transaction_ref: Option<String>,
    pub date: NaiveDate,
    pub date_maturity: NaiveDate,
    pub debit: f64,
    pub credit: f64,
    pub account_id: Option<i64>,
    pub partner_id: Option<i64>,
    pub already_completed: bool,
}

impl NewMoveLine {
    /// Build a typed line out of normalized values. Fields missing here
    /// mean the defaults were not applied.
    pub fn from_vals(vals: &LineVals) -> Result<Self> {
        let get = |key: &str| vals.get(key).cloned().unwrap_or(FieldValue::Null);
        let required_id = |key: &str| -> Result<i64> {
            get(key)
                .as_opt_i64(key)?
                .ok_or_else(|| invalid(key, "null"))
        };
        let required_text = |key: &str| -> Result<String> {
            get(key).as_opt_text().ok_or_else(|| invalid(key, "null"))
        };
        Ok(Self {
            move_id: required_id("move_id")?,
            journal_id: required_id("journal_id")?,
            company_id: required_id("company_id")?,
            currency: required_text("currency")?,
            company_currency: required_text("company_currency")?,
            name: required_text("name")?,
            reference: get("ref").as_opt_text(),
            transaction_ref: get("transaction_ref").as_opt_text(),
            date: get("date").as_date("date")?,
            date_maturity: get("date_maturity").as_date("date_maturity")?,
            debit: get("debit").as_f64("debit")?,
            credit: get("credit").as_f64("credit")?,
            account_id: get("account_id").as_opt_i64("account_id")?,
            partner_id: get("partner_id").as_opt_i64("partner_id")?,
            already_completed: get("already_completed").as_bool("already_completed")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_type_keys() {
        assert_eq!(
            ImportType::from_key("generic_csvxls_so").unwrap(),
            ImportType::GenericCsvXlsSo
        );
        assert!(matches!(
            ImportType::from_key("mt940"),
            Err(ImportError::UnknownImportType(k)) if k == "mt940"
        ));
    }

    #[test]
    fn test_field_value_conversions() {
        assert_eq!(FieldValue::Text(" 12.5 ".into()).as_f64("debit").unwrap(), 12.5);
        assert_eq!(FieldValue::Null.as_f64("debit").unwrap(), 0.0);
        assert_eq!(FieldValue::Text("".into()).as_opt_i64("partner_id").unwrap(), None);
        assert_eq!(FieldValue::Int(4).as_opt_i64("partner_id").unwrap(), Some(4));
        assert!(FieldValue::Text("yes".into()).as_bool("already_completed").unwrap());
        assert!(FieldValue::Text("abc".into()).as_f64("credit").is_err());
    }

    #[test]
    fn test_move_line_schema() {
        assert!(is_move_line_field("partner_id"));
        assert!(!is_move_line_field("commission_amount"));
        assert!(!is_move_line_field("label"));
    }

    #[test]
    fn test_new_move_line_requires_move_id() {
        let mut vals = LineVals::new();
        vals.insert("name".into(), FieldValue::Text("x".into()));
        let err = NewMoveLine::from_vals(&vals).unwrap_err();
        assert!(matches!(err, ImportError::InvalidValue { field, .. } if field == "move_id"));
    }

    #[test]
    fn test_line_amount_sign() {
        let line = MoveLine {
            id: 1,
            move_id: 1,
            name: "x".into(),
            reference: None,
            transaction_ref: None,
            date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            debit: 20.0,
            credit: 0.0,
            account_id: None,
            partner_id: None,
            currency: "EUR".into(),
            already_completed: false,
        };
        assert_eq!(line.amount(), -20.0);
    }
}
