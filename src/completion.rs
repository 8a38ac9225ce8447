use std::cell::OnceCell;
use std::collections::{BTreeSet, HashMap};

use regex::Regex;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::error::{ImportError, Result};
use crate::models::{CompletionRule, ImportProfile, MoveLine};

/// Values a rule found for a line. Empty when the rule did not match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub partner_id: Option<i64>,
    pub account_id: Option<i64>,
    pub already_completed: bool,
}

impl Completion {
    pub fn is_empty(&self) -> bool {
        self.partner_id.is_none() && self.account_id.is_none()
    }
}

pub type RuleFn = Box<dyn Fn(&RuleContext<'_>, &MoveLine) -> Result<Completion>>;

/// Partner id and the compiled pattern its label is searched with.
type PartnerPatterns = Vec<(i64, Regex)>;

/// State shared by the rules during one completion pass. Partner patterns
/// are compiled on first use and reused for every later line of the pass.
pub struct RuleContext<'c> {
    pub conn: &'c Connection,
    partner_names: OnceCell<PartnerPatterns>,
    partner_labels: OnceCell<PartnerPatterns>,
}

impl<'c> RuleContext<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            partner_names: OnceCell::new(),
            partner_labels: OnceCell::new(),
        }
    }

    fn partner_names(&self) -> Result<&PartnerPatterns> {
        if let Some(patterns) = self.partner_names.get() {
            return Ok(patterns);
        }
        let patterns = compile_partner_names(self.conn)?;
        Ok(self.partner_names.get_or_init(|| patterns))
    }

    fn partner_labels(&self) -> Result<&PartnerPatterns> {
        if let Some(patterns) = self.partner_labels.get() {
            return Ok(patterns);
        }
        let patterns = compile_partner_labels(self.conn)?;
        Ok(self.partner_labels.get_or_init(|| patterns))
    }
}

// ---------------------------------------------------------------------------
// Builtin rules, keyed by the stored function name
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinRule {
    FromRefAndSo,
    FromRefAndInvoice,
    FromLabelAndPartnerField,
    FromLabelAndPartnerName,
}

impl BuiltinRule {
    pub const ALL: &'static [BuiltinRule] = &[
        BuiltinRule::FromRefAndSo,
        BuiltinRule::FromRefAndInvoice,
        BuiltinRule::FromLabelAndPartnerField,
        BuiltinRule::FromLabelAndPartnerName,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Self::FromRefAndSo => "get_from_ref_and_so",
            Self::FromRefAndInvoice => "get_from_ref_and_invoice",
            Self::FromLabelAndPartnerField => "get_from_label_and_partner_field",
            Self::FromLabelAndPartnerName => "get_from_label_and_partner_name",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FromRefAndSo => "From line reference (based on SO number)",
            Self::FromRefAndInvoice => "From line reference (based on invoice number)",
            Self::FromLabelAndPartnerField => "From line label (based on partner field)",
            Self::FromLabelAndPartnerName => "From line label (based on partner name)",
        }
    }

    pub fn call(&self, ctx: &RuleContext<'_>, line: &MoveLine) -> Result<Completion> {
        match self {
            Self::FromRefAndSo => {
                from_ref(ctx.conn, line, "SELECT partner_id FROM sale_orders WHERE name = ?1")
            }
            Self::FromRefAndInvoice => {
                from_ref(ctx.conn, line, "SELECT partner_id FROM invoices WHERE number = ?1")
            }
            Self::FromLabelAndPartnerField => match_label(ctx.conn, line, ctx.partner_labels()?),
            Self::FromLabelAndPartnerName => match_label(ctx.conn, line, ctx.partner_names()?),
        }
    }
}

/// Partner plus the account it books to: receivable for money received,
/// payable otherwise.
fn partner_completion(conn: &Connection, partner_id: i64, line: &MoveLine) -> Result<Completion> {
    let (receivable, payable): (Option<i64>, Option<i64>) = conn.query_row(
        "SELECT receivable_account_id, payable_account_id FROM partners WHERE id = ?1",
        [partner_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let account_id = if line.amount() > 0.0 { receivable } else { payable };
    Ok(Completion {
        partner_id: Some(partner_id),
        account_id: account_id.or(line.account_id),
        already_completed: false,
    })
}

fn single_partner(conn: &Connection, line: &MoveLine, partners: BTreeSet<i64>) -> Result<Completion> {
    match partners.len() {
        0 => Ok(Completion::default()),
        1 => {
            let id = partners.into_iter().next().unwrap_or_default();
            partner_completion(conn, id, line)
        }
        count => Err(ImportError::TooManyPartners {
            label: line.name.clone(),
            count,
        }),
    }
}

fn from_ref(conn: &Connection, line: &MoveLine, sql: &str) -> Result<Completion> {
    let Some(reference) = line.reference.as_deref().map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(Completion::default());
    };
    let partner: Option<i64> = conn.query_row(sql, [reference], |r| r.get(0)).optional()?;
    single_partner(conn, line, partner.into_iter().collect())
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ImportError::Other(e.to_string()))
}

/// `statement_label` holds `;`-separated values searched case-insensitively
/// in the line label. `%` matches any run of characters and `_` any single
/// character; everything else is literal.
fn label_pattern(field: &str) -> Option<String> {
    let alternatives: Vec<String> = field
        .split(';')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| regex::escape(value).replace('%', ".*").replace('_', "."))
        .collect();
    if alternatives.is_empty() {
        return None;
    }
    Some(format!("(?i)(?:{})", alternatives.join("|")))
}

/// The partner name as a whole phrase: bounded by non-word characters or
/// the ends of the label. Blank names never match.
fn name_pattern(name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(format!(r"(?i)(?:^|\W){}(?:\W|$)", regex::escape(name)))
}

fn compile_partners(
    conn: &Connection,
    sql: &str,
    to_pattern: fn(&str) -> Option<String>,
) -> Result<PartnerPatterns> {
    let mut stmt = conn.prepare_cached(sql)?;
    let candidates: Vec<(i64, String)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut patterns = Vec::with_capacity(candidates.len());
    for (id, value) in candidates {
        if let Some(pattern) = to_pattern(&value) {
            patterns.push((id, compile(&pattern)?));
        }
    }
    debug!(partners = patterns.len(), "Partner patterns compiled");
    Ok(patterns)
}

fn compile_partner_labels(conn: &Connection) -> Result<PartnerPatterns> {
    compile_partners(
        conn,
        "SELECT id, statement_label FROM partners WHERE statement_label IS NOT NULL AND statement_label != ''",
        label_pattern,
    )
}

fn compile_partner_names(conn: &Connection) -> Result<PartnerPatterns> {
    compile_partners(conn, "SELECT id, name FROM partners", name_pattern)
}

fn match_label(conn: &Connection, line: &MoveLine, patterns: &PartnerPatterns) -> Result<Completion> {
    let partners = patterns
        .iter()
        .filter(|(_, re)| re.is_match(&line.name))
        .map(|(id, _)| *id)
        .collect();
    single_partner(conn, line, partners)
}

// ---------------------------------------------------------------------------
// Registry and engine
// ---------------------------------------------------------------------------

/// Maps rule function names to callables. Profiles are checked against it
/// when they are loaded.
pub struct RuleRegistry {
    functions: HashMap<String, RuleFn>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for rule in BuiltinRule::ALL {
            let rule = *rule;
            registry.register(rule.key(), move |ctx, line| rule.call(ctx, line));
        }
        registry
    }

    pub fn register<F>(&mut self, key: &str, function: F)
    where
        F: Fn(&RuleContext<'_>, &MoveLine) -> Result<Completion> + 'static,
    {
        self.functions.insert(key.to_string(), Box::new(function));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.functions.contains_key(key)
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn validate(&self, rules: &[CompletionRule]) -> Result<()> {
        match rules.iter().find(|r| !self.contains(&r.function_to_call)) {
            Some(rule) => Err(ImportError::UnknownRule(rule.function_to_call.clone())),
            None => Ok(()),
        }
    }

    pub fn engine(&self, rules: &[CompletionRule]) -> Result<CompletionEngine<'_>> {
        self.validate(rules)?;
        let mut rules = rules.to_vec();
        rules.sort_by_key(|r| r.sequence);
        Ok(CompletionEngine {
            registry: self,
            rules,
        })
    }

    fn get(&self, key: &str) -> Result<&RuleFn> {
        self.functions
            .get(key)
            .ok_or_else(|| ImportError::UnknownRule(key.to_string()))
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

pub struct CompletionEngine<'r> {
    registry: &'r RuleRegistry,
    rules: Vec<CompletionRule>,
}

impl CompletionEngine<'_> {
    /// Run the rules in order and return the values of the first one that
    /// matches, flagged as completed. Later rules are not evaluated.
    /// `calls` replaces the profile's rule set when given.
    pub fn find_values(
        &self,
        calls: Option<&[CompletionRule]>,
        ctx: &RuleContext<'_>,
        line: &MoveLine,
    ) -> Result<Option<Completion>> {
        let calls = calls.unwrap_or(&self.rules);
        for call in calls {
            let function = self.registry.get(&call.function_to_call)?;
            let mut result = function(ctx, line)?;
            if !result.is_empty() {
                result.already_completed = true;
                return Ok(Some(result));
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Completion pass over an imported move
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq)]
pub struct CompletionResult {
    pub completed: usize,
    pub still_open: usize,
}

pub fn get_open_lines(conn: &Connection, move_id: i64) -> Result<Vec<MoveLine>> {
    crate::store::get_lines(conn, move_id).map(|lines| {
        lines.into_iter().filter(|l| !l.already_completed).collect()
    })
}

/// Complete every line of `move_id` that is not already completed.
/// A line matched by several partners stays open and the conflict is
/// written to the move log.
pub fn auto_complete_move(
    conn: &Connection,
    profile: &ImportProfile,
    registry: &RuleRegistry,
    move_id: i64,
) -> Result<CompletionResult> {
    let lines = get_open_lines(conn, move_id)?;
    if !profile.used_for_completion {
        return Ok(CompletionResult {
            completed: 0,
            still_open: lines.len(),
        });
    }
    let engine = registry.engine(&profile.rules)?;
    let ctx = RuleContext::new(conn);

    let mut result = CompletionResult::default();
    let mut conflicts = Vec::new();
    for line in &lines {
        match engine.find_values(None, &ctx, line) {
            Ok(Some(values)) => {
                conn.execute(
                    "UPDATE move_lines SET partner_id = ?1, account_id = ?2, already_completed = 1 WHERE id = ?3",
                    rusqlite::params![
                        values.partner_id.or(line.partner_id),
                        values.account_id.or(line.account_id),
                        line.id
                    ],
                )?;
                debug!(line_id = line.id, partner_id = ?values.partner_id, "Line completed");
                result.completed += 1;
            }
            Ok(None) => result.still_open += 1,
            Err(err @ ImportError::TooManyPartners { .. }) => {
                warn!(line_id = line.id, "{err}");
                conflicts.push(err.to_string());
                result.still_open += 1;
            }
            Err(err) => return Err(err),
        }
    }

    let mut body = format!(
        "Completion: {} lines completed, {} left to complete.",
        result.completed, result.still_open
    );
    for conflict in &conflicts {
        body.push('\n');
        body.push_str(conflict);
    }
    crate::store::append_log(conn, move_id, &body)?;
    Ok(result)
}
