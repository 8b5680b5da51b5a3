//! Query compilation.
//!
//! A structured query is a list of clauses ANDed together; each clause
//! compiles to one SQL fragment. Stream conditions arrive in disjunctive
//! normal form (a list of AND-blocks of `{any}`/`{not}` items) and compile
//! to one FTS5 `MATCH` expression over the mirrored `streamIds` column.

use serde::{Deserialize, Serialize};

use crate::{DbResult, QuerySnafu, UNIVERSAL_TAG};

/// Queryable row fields. Whitelisting them here is what keeps the string
/// composition below injection-safe: field names never come from input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Time,
    EndTime,
    Deleted,
    Trashed,
    Created,
    CreatedBy,
    Modified,
    ModifiedBy,
    HeadId,
    EventId,
}

impl Field {
    fn column(self) -> &'static str {
        match self {
            Field::Time => "time",
            Field::EndTime => "endTime",
            Field::Deleted => "deleted",
            Field::Trashed => "trashed",
            Field::Created => "created",
            Field::CreatedBy => "createdBy",
            Field::Modified => "modified",
            Field::ModifiedBy => "modifiedBy",
            Field::HeadId => "headId",
            Field::EventId => "eventid",
        }
    }
}

/// A coerced comparison operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Null,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl Operand {
    fn literal(&self) -> String {
        match self {
            Operand::Null => "NULL".to_owned(),
            Operand::Text(text) => quote_text(text),
            Operand::Number(n) => format!("{n}"),
            Operand::Bool(b) => if *b { "1" } else { "0" }.to_owned(),
        }
    }
}

fn quote_text(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryClause {
    Equal { field: Field, value: Operand },
    Greater { field: Field, value: Operand },
    GreaterOrEqual { field: Field, value: Operand },
    LowerOrEqual { field: Field, value: Operand },
    /// `(field >= value OR field IS NULL)` — open-ended `endTime`.
    GreaterOrEqualOrNull { field: Field, value: Operand },
    /// OR over exact types; a trailing `/*` widens to a prefix match.
    TypesList { types: Vec<String> },
    StreamsQuery { query: StreamQuery },
}

/// One `{any}` or `{not}` item of an AND-block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamQueryItem {
    Any(Vec<String>),
    Not(Vec<String>),
}

/// All items of one block must hold simultaneously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AndBlock(pub Vec<StreamQueryItem>);

/// Disjunction of AND-blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct StreamQuery(pub Vec<AndBlock>);

impl StreamQuery {
    /// Single block matching any of the given ids.
    pub fn any_of(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        StreamQuery(vec![AndBlock(vec![StreamQueryItem::Any(
            ids.into_iter().map(Into::into).collect(),
        )])])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reference semantics of the compiled MATCH expression, evaluated
    /// against an event's stream-id list (universal tag implied). The FTS
    /// compilation must agree with this for every query.
    pub fn matches(&self, stream_ids: &[&str]) -> bool {
        if self.0.is_empty() {
            return true;
        }
        self.0.iter().any(|block| {
            block.0.iter().all(|item| match item {
                StreamQueryItem::Any(ids) => {
                    ids.is_empty()
                        || ids.iter().any(|id| id == "*")
                        || ids.iter().any(|id| stream_ids.contains(&id.as_str()))
                }
                StreamQueryItem::Not(ids) => {
                    !ids.iter().any(|id| stream_ids.contains(&id.as_str()))
                }
            })
        })
    }
}

fn quote_token(token: &str) -> String {
    format!("\"{}\"", token.replace('"', "\"\""))
}

fn compile_and_block(block: &AndBlock) -> String {
    let mut positives: Vec<String> = Vec::new();
    let mut negatives: Vec<&str> = Vec::new();

    for item in &block.0 {
        match item {
            StreamQueryItem::Any(ids) => {
                // a wildcard makes the whole item vacuous
                if ids.is_empty() || ids.iter().any(|id| id == "*") {
                    continue;
                }
                if ids.len() == 1 {
                    positives.push(quote_token(&ids[0]));
                } else {
                    let alternatives: Vec<String> =
                        ids.iter().map(|id| quote_token(id)).collect();
                    positives.push(format!("({})", alternatives.join(" OR ")));
                }
            }
            StreamQueryItem::Not(ids) => {
                negatives.extend(ids.iter().map(String::as_str));
            }
        }
    }

    if positives.is_empty() {
        // every stored row carries the universal tag
        positives.push(quote_token(UNIVERSAL_TAG));
    }

    let mut expr = positives.join(" AND ");
    for id in negatives {
        expr.push_str(" NOT ");
        expr.push_str(&quote_token(id));
    }
    expr
}

/// Compile a stream query to the FTS5 MATCH expression.
pub fn compile_streams_match(query: &StreamQuery) -> String {
    let blocks: Vec<String> = query.0.iter().map(compile_and_block).collect();
    match blocks.len() {
        0 => quote_token(UNIVERSAL_TAG),
        1 => blocks.into_iter().next().expect("one block"),
        _ => blocks
            .iter()
            .map(|b| format!("({b})"))
            .collect::<Vec<_>>()
            .join(" OR "),
    }
}

/// A compiled WHERE body (without the leading `WHERE`).
#[derive(Debug, Clone)]
pub(crate) struct CompiledWhere {
    pub conditions: Vec<String>,
    /// Set when the query carries a stream condition; bulk DELETE cannot
    /// cross a MATCH, so deletion falls back to row-by-row.
    pub stream_match: Option<String>,
}

impl CompiledWhere {
    pub fn sql(&self) -> String {
        if self.conditions.is_empty() {
            "1".to_owned()
        } else {
            self.conditions.join(" AND ")
        }
    }
}

pub(crate) fn compile_clauses(clauses: &[QueryClause]) -> DbResult<CompiledWhere> {
    let mut conditions = Vec::new();
    let mut stream_match = None;

    for clause in clauses {
        match clause {
            QueryClause::Equal { field, value } => match value {
                Operand::Null => conditions.push(format!("{} IS NULL", field.column())),
                other => {
                    conditions.push(format!("{} = {}", field.column(), other.literal()));
                }
            },
            QueryClause::Greater { field, value } => {
                conditions.push(format!("{} > {}", field.column(), numeric(value)?));
            }
            QueryClause::GreaterOrEqual { field, value } => {
                conditions.push(format!("{} >= {}", field.column(), numeric(value)?));
            }
            QueryClause::LowerOrEqual { field, value } => {
                conditions.push(format!("{} <= {}", field.column(), numeric(value)?));
            }
            QueryClause::GreaterOrEqualOrNull { field, value } => {
                conditions.push(format!(
                    "({col} >= {val} OR {col} IS NULL)",
                    col = field.column(),
                    val = numeric(value)?,
                ));
            }
            QueryClause::TypesList { types } => {
                if types.is_empty() {
                    continue;
                }
                let alternatives: Vec<String> = types
                    .iter()
                    .map(|t| match t.strip_suffix("/*") {
                        Some(class) => {
                            format!("type LIKE {}", quote_text(&format!("{class}/%")))
                        }
                        None => format!("type = {}", quote_text(t)),
                    })
                    .collect();
                conditions.push(format!("({})", alternatives.join(" OR ")));
            }
            QueryClause::StreamsQuery { query } => {
                let expr = compile_streams_match(query);
                conditions.push(format!(
                    "rowid IN (SELECT rowid FROM events_fts WHERE events_fts MATCH {})",
                    quote_text(&expr),
                ));
                stream_match = Some(expr);
            }
        }
    }

    Ok(CompiledWhere {
        conditions,
        stream_match,
    })
}

fn numeric(value: &Operand) -> DbResult<String> {
    match value {
        Operand::Number(_) => Ok(value.literal()),
        other => QuerySnafu {
            message: format!("comparison needs a numeric operand, got {other:?}"),
        }
        .fail(),
    }
}

/// Listing options shared by `get`, `count` and streaming reads.
#[derive(Debug, Clone, Default)]
pub struct EventsQuery {
    pub clauses: Vec<QueryClause>,
    pub sort_ascending: bool,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
}

impl EventsQuery {
    pub fn new(clauses: Vec<QueryClause>) -> Self {
        Self {
            clauses,
            ..Default::default()
        }
    }
}
