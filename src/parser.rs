use chrono::NaiveDate;

use crate::error::{ImportError, Result};
use crate::models::{FieldValue, ImportProfile, ImportType, LineVals, ParsedRow};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a statement amount. `.` is the only decimal separator: commas are
/// thousands separators, and a lone comma before exactly two digits
/// (`12,50`) is rejected rather than read as 1250. Currency symbols and
/// parenthesized negatives are accepted; blank means zero.
pub fn parse_amount(raw: &str) -> Option<f64> {
    if is_decimal_comma(raw) {
        return None;
    }
    let s = raw
        .replace(',', "")
        .replace('"', "")
        .replace(['$', '€', '£'], "");
    let s = s.trim();
    if s.is_empty() {
        return Some(0.0);
    }
    if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        return inner.trim().parse::<f64>().ok().map(|v| -v);
    }
    s.parse().ok()
}

fn is_decimal_comma(raw: &str) -> bool {
    if raw.contains('.') || raw.matches(',').count() != 1 {
        return false;
    }
    raw.split_once(',').is_some_and(|(_, decimals)| {
        let digits: String = decimals.chars().take_while(|c| c.is_ascii_digit()).collect();
        let rest = decimals[digits.len()..]
            .trim_matches(|c: char| c.is_whitespace() || matches!(c, ')' | '"' | '$' | '€' | '£'));
        digits.len() == 2 && rest.is_empty()
    })
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    ["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%d.%m.%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

#[cfg(any(feature = "xls", test))]
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() {
        return None;
    }
    // Excel epoch is 1899-12-30 (accounting for the 1900 leap year bug)
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    base.checked_add_signed(chrono::Duration::try_days(serial as i64)?)
}

// ---------------------------------------------------------------------------
// File types and column casting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Csv,
    Xls,
    Xlsx,
}

impl FileType {
    pub fn from_key(key: &str) -> Result<Self> {
        match key.trim().trim_start_matches('.').to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "xls" => Ok(Self::Xls),
            "xlsx" => Ok(Self::Xlsx),
            other => Err(ImportError::UnknownFileType(other.to_string())),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Xls => "xls",
            Self::Xlsx => "xlsx",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Cast {
    Text,
    Date,
    Amount,
}

/// Columns the generic parser understands. Any other column is passed
/// through to the line values untouched.
const CONVERSIONS: &[(&str, Cast)] = &[
    ("ref", Cast::Text),
    ("label", Cast::Text),
    ("transaction_id", Cast::Text),
    ("date", Cast::Date),
    ("amount", Cast::Amount),
    ("commission_amount", Cast::Amount),
];

const REQUIRED_COLUMNS: &[&str] = &["date", "amount"];

/// A cell before casting.
#[derive(Debug, Clone)]
enum RawCell {
    Empty,
    Text(String),
    Number(f64),
}

fn cast(column: &str, cell: RawCell) -> Result<FieldValue> {
    let conversion = CONVERSIONS.iter().find(|(name, _)| *name == column).map(|(_, c)| *c);
    let invalid = |value: String| ImportError::InvalidValue {
        field: column.to_string(),
        value,
    };
    Ok(match (conversion, cell) {
        (_, RawCell::Empty) => match conversion {
            Some(Cast::Amount) => FieldValue::Float(0.0),
            _ => FieldValue::Null,
        },
        (Some(Cast::Amount), RawCell::Number(n)) => FieldValue::Float(n),
        (Some(Cast::Amount), RawCell::Text(s)) => {
            FieldValue::Float(parse_amount(&s).ok_or_else(|| invalid(s.clone()))?)
        }
        (Some(Cast::Date), RawCell::Text(s)) => {
            FieldValue::Date(parse_date(&s).ok_or_else(|| invalid(s.clone()))?)
        }
        #[cfg(feature = "xls")]
        (Some(Cast::Date), RawCell::Number(n)) => {
            FieldValue::Date(excel_serial_to_date(n).ok_or_else(|| invalid(n.to_string()))?)
        }
        #[cfg(not(feature = "xls"))]
        (Some(Cast::Date), RawCell::Number(n)) => return Err(invalid(n.to_string())),
        (Some(Cast::Text), RawCell::Number(n)) => FieldValue::Text(format_number(n)),
        (_, RawCell::Text(s)) => FieldValue::Text(s.trim().to_string()),
        (None, RawCell::Number(n)) => FieldValue::Float(n),
    })
}

/// Spreadsheets store references like `1042` as floats.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn normalize_header(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn build_rows(headers: &[String], records: Vec<Vec<RawCell>>) -> Result<Vec<ParsedRow>> {
    let mut rows = Vec::new();
    for record in records {
        if record.iter().all(|c| matches!(c, RawCell::Empty)) {
            continue;
        }
        let mut row = ParsedRow::new();
        for (header, cell) in headers.iter().zip(record.into_iter()) {
            if header.is_empty() {
                continue;
            }
            row.insert(header.clone(), cast(header, cell)?);
        }
        rows.push(row);
    }
    if !rows.is_empty() {
        if let Some(missing) = REQUIRED_COLUMNS.iter().find(|c| !headers.iter().any(|h| h == *c)) {
            return Err(ImportError::MissingColumn(missing.to_string()));
        }
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Row groups
// ---------------------------------------------------------------------------

/// Header values supplied by the parser for one statement.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveHeader {
    pub reference: String,
    pub date: NaiveDate,
}

/// One logical statement inside a file.
#[derive(Debug, Clone)]
pub struct RowGroup {
    pub result_row_list: Vec<ParsedRow>,
    pub move_ref: Option<String>,
}

impl RowGroup {
    /// Statement date is the latest row date, today when there is none.
    pub fn get_move_vals(&self) -> MoveHeader {
        let date = self
            .result_row_list
            .iter()
            .filter_map(|row| match row.get("date") {
                Some(FieldValue::Date(d)) => Some(*d),
                _ => None,
            })
            .max()
            .unwrap_or_else(|| chrono::Local::now().date_naive());
        MoveHeader {
            reference: self.move_ref.clone().unwrap_or_else(|| "/".to_string()),
            date,
        }
    }

    pub fn get_move_line_vals(&self, row: &ParsedRow) -> LineVals {
        let amount = match row.get("amount") {
            Some(FieldValue::Float(f)) => *f,
            _ => 0.0,
        };
        let text = |key: &str| match row.get(key) {
            Some(FieldValue::Text(s)) if !s.is_empty() => FieldValue::Text(s.clone()),
            _ => FieldValue::Null,
        };
        let mut vals = LineVals::new();
        vals.insert(
            "name".into(),
            match text("label") {
                FieldValue::Null => FieldValue::Text("/".into()),
                label => label,
            },
        );
        vals.insert("ref".into(), text("ref"));
        vals.insert("transaction_ref".into(), text("transaction_id"));
        if let Some(date) = row.get("date").filter(|d| **d != FieldValue::Null) {
            vals.insert("date".into(), date.clone());
            vals.insert("date_maturity".into(), date.clone());
        }
        vals.insert("credit".into(), FieldValue::Float(if amount > 0.0 { amount } else { 0.0 }));
        vals.insert("debit".into(), FieldValue::Float(if amount < 0.0 { -amount } else { 0.0 }));
        vals.insert("already_completed".into(), FieldValue::Bool(false));
        vals.insert("partner_id".into(), FieldValue::Null);
        vals.insert("account_id".into(), FieldValue::Null);

        for (key, value) in row {
            if !CONVERSIONS.iter().any(|(name, _)| name == key) {
                vals.insert(key.clone(), value.clone());
            }
        }
        vals
    }

    /// Sum of a numeric column across all rows.
    pub fn column_total(&self, column: &str) -> f64 {
        self.result_row_list
            .iter()
            .map(|row| match row.get(column) {
                Some(FieldValue::Float(f)) => *f,
                _ => 0.0,
            })
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

pub trait RowParser {
    /// Split the file into statements. Yields at least one group; an empty
    /// file gives one group without rows.
    fn parse(&mut self, data: &[u8]) -> Result<Vec<RowGroup>>;

    fn file_type(&self) -> FileType;
}

pub fn new_move_parser(
    profile: &ImportProfile,
    ftype: FileType,
    move_ref: Option<&str>,
) -> Box<dyn RowParser> {
    match profile.import_type {
        ImportType::GenericCsvXlsSo => Box::new(GenericFileParser {
            ftype,
            move_ref: move_ref.map(str::to_string),
        }),
    }
}

/// CSV yields one statement; spreadsheets one statement per non-empty sheet.
pub struct GenericFileParser {
    ftype: FileType,
    move_ref: Option<String>,
}

impl GenericFileParser {
    fn parse_csv(&self, data: &[u8]) -> Result<Vec<RowGroup>> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(data);
        let headers: Vec<String> = rdr.headers()?.iter().map(normalize_header).collect();
        let mut records = Vec::new();
        for result in rdr.records() {
            let record = result?;
            records.push(
                record
                    .iter()
                    .map(|f| {
                        if f.trim().is_empty() {
                            RawCell::Empty
                        } else {
                            RawCell::Text(f.to_string())
                        }
                    })
                    .collect(),
            );
        }
        Ok(vec![RowGroup {
            result_row_list: build_rows(&headers, records)?,
            move_ref: self.move_ref.clone(),
        }])
    }

    #[cfg(feature = "xls")]
    fn parse_workbook(&self, data: &[u8]) -> Result<Vec<RowGroup>> {
        use std::collections::BTreeMap;

        use calamine::{Data, Reader};

        let mut workbook = calamine::open_workbook_auto_from_rs(std::io::Cursor::new(data.to_vec()))
            .map_err(|e| ImportError::Spreadsheet(format!("Failed to open workbook: {e}")))?;

        let mut sheets: BTreeMap<usize, (String, Vec<ParsedRow>)> = BTreeMap::new();
        for (index, name) in workbook.sheet_names().into_iter().enumerate() {
            let range = workbook
                .worksheet_range(&name)
                .map_err(|e| ImportError::Spreadsheet(format!("Sheet {name}: {e}")))?;
            let mut rows = range.rows();
            let Some(header_row) = rows.next() else {
                continue;
            };
            let headers: Vec<String> = header_row
                .iter()
                .map(|c| normalize_header(&c.to_string()))
                .collect();
            let records: Vec<Vec<RawCell>> = rows
                .map(|row| {
                    row.iter()
                        .map(|cell| match cell {
                            Data::Empty => RawCell::Empty,
                            Data::Float(f) => RawCell::Number(*f),
                            Data::Int(i) => RawCell::Number(*i as f64),
                            Data::DateTime(dt) => RawCell::Number(dt.as_f64()),
                            Data::String(s) if s.trim().is_empty() => RawCell::Empty,
                            other => RawCell::Text(other.to_string()),
                        })
                        .collect()
                })
                .collect();
            let parsed = build_rows(&headers, records)?;
            if !parsed.is_empty() {
                sheets.insert(index, (name, parsed));
            }
        }

        if sheets.is_empty() {
            return Ok(vec![RowGroup {
                result_row_list: Vec::new(),
                move_ref: self.move_ref.clone(),
            }]);
        }
        let several = sheets.len() > 1;
        Ok(sheets
            .into_values()
            .map(|(sheet, rows)| RowGroup {
                result_row_list: rows,
                move_ref: match (&self.move_ref, several) {
                    (Some(r), true) => Some(format!("{r} - {sheet}")),
                    (None, true) => Some(sheet),
                    (r, false) => r.clone(),
                },
            })
            .collect())
    }
}

impl RowParser for GenericFileParser {
    fn parse(&mut self, data: &[u8]) -> Result<Vec<RowGroup>> {
        match self.ftype {
            FileType::Csv => self.parse_csv(data),
            #[cfg(feature = "xls")]
            FileType::Xls | FileType::Xlsx => self.parse_workbook(data),
            #[cfg(not(feature = "xls"))]
            other => Err(ImportError::UnknownFileType(other.extension().to_string())),
        }
    }

    fn file_type(&self) -> FileType {
        self.ftype
    }
}
