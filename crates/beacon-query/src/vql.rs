// VQL: the restricted, read-only query language.
//
// A hand-rolled lexer and recursive-descent parser for a SELECT-only
// grammar. The whitelist is the security boundary: only the `metrics`
// table and its declared columns exist, string literals are carried as
// typed values (never interpolated), write keywords and `;` are rejected
// during lexing, and execution always applies a server-side row cap.
//
// `Display` renders the canonical form; `parse(q.to_string())` returns an
// AST equal to `q` for every accepted query.

use std::collections::BTreeMap;
use std::fmt;

use beacon_core::{quantile_of_sorted, StoredRow};
use beacon_store::{RowFilter, Store, StoreError, TimeWindow};
use serde::Serialize;

/// The only queryable table.
pub const TABLE: &str = "metrics";

/// Declared column whitelist.
pub const COLUMNS: &[&str] = &[
    "timestamp",
    "service_name",
    "metric_name",
    "metric_type",
    "value",
    "endpoint",
    "method",
    "status_code",
    "duration_ms",
    "environment",
];

const GROUPABLE: &[&str] = &[
    "service_name",
    "metric_name",
    "metric_type",
    "endpoint",
    "method",
    "status_code",
    "environment",
];

const NUMERIC: &[&str] = &["timestamp", "value", "status_code", "duration_ms"];

const FORBIDDEN: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "ATTACH", "DETACH", "TRUNCATE", "GRANT",
    "REVOKE", "CREATE",
];

/// Hard server-side cap on returned rows and scanned candidates.
pub const MAX_LIMIT: u64 = 10_000;
const MAX_CONDS: usize = 10;
const DEFAULT_WINDOW_MS: i64 = 86_400_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VqlError {
    pub token: String,
    pub message: String,
}

impl VqlError {
    fn new(token: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for VqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at `{}`)", self.message, self.token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Avg,
    Sum,
    Min,
    Max,
    Count,
    P50,
    P95,
    P99,
}

impl AggFunc {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "AVG" => Some(AggFunc::Avg),
            "SUM" => Some(AggFunc::Sum),
            "MIN" => Some(AggFunc::Min),
            "MAX" => Some(AggFunc::Max),
            "COUNT" => Some(AggFunc::Count),
            "P50" => Some(AggFunc::P50),
            "P95" => Some(AggFunc::P95),
            "P99" => Some(AggFunc::P99),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            AggFunc::Avg => "AVG",
            AggFunc::Sum => "SUM",
            AggFunc::Min => "MIN",
            AggFunc::Max => "MAX",
            AggFunc::Count => "COUNT",
            AggFunc::P50 => "P50",
            AggFunc::P95 => "P95",
            AggFunc::P99 => "P99",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggExpr {
    Column(String),
    Call { func: AggFunc, column: String },
}

impl fmt::Display for AggExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggExpr::Column(c) => write!(f, "{c}"),
            AggExpr::Call { func, column } => write!(f, "{}({column})", func.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Star,
    Exprs(Vec<AggExpr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(v) => write!(f, "{v}"),
            // Debug formatting keeps the decimal point, so floats re-parse
            // as floats.
            Literal::Float(v) => write!(f, "{v:?}"),
            Literal::Str(s) => write!(f, "'{s}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cond {
    pub column: String,
    pub op: CmpOp,
    pub value: Literal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub projection: Projection,
    pub conds: Vec<Cond>,
    pub group_by: Vec<String>,
    pub order_by: Option<(String, Option<SortDir>)>,
    pub limit: Option<u64>,
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT ")?;
        match &self.projection {
            Projection::Star => write!(f, "*")?,
            Projection::Exprs(exprs) => {
                for (i, expr) in exprs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{expr}")?;
                }
            }
        }
        write!(f, " FROM {TABLE}")?;
        for (i, cond) in self.conds.iter().enumerate() {
            let kw = if i == 0 { "WHERE" } else { "AND" };
            write!(f, " {kw} {} {} {}", cond.column, cond.op.as_str(), cond.value)?;
        }
        if !self.group_by.is_empty() {
            write!(f, " GROUP BY {}", self.group_by.join(", "))?;
        }
        if let Some((column, dir)) = &self.order_by {
            write!(f, " ORDER BY {column}")?;
            match dir {
                Some(SortDir::Asc) => write!(f, " ASC")?,
                Some(SortDir::Desc) => write!(f, " DESC")?,
                None => {}
            }
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Num(String),
    Str(String),
    Op(CmpOp),
    Comma,
    LParen,
    RParen,
    Star,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Ident(s) => s.clone(),
            Tok::Num(s) => s.clone(),
            Tok::Str(s) => format!("'{s}'"),
            Tok::Op(op) => op.as_str().to_string(),
            Tok::Comma => ",".into(),
            Tok::LParen => "(".into(),
            Tok::RParen => ")".into(),
            Tok::Star => "*".into(),
        }
    }
}

fn lex(input: &str) -> Result<Vec<Tok>, VqlError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => s.push(ch),
                        None => {
                            return Err(VqlError::new("'", "unterminated string literal"));
                        }
                    }
                }
                tokens.push(Tok::Str(s));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' {
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let upper = s.to_ascii_uppercase();
                if FORBIDDEN.contains(&upper.as_str()) {
                    return Err(VqlError::new(s, "write statements are not allowed"));
                }
                tokens.push(Tok::Ident(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(&ch) = chars.peek() {
                    let after_exponent = matches!(s.chars().last(), Some('e' | 'E'));
                    if ch.is_ascii_digit()
                        || ch == '.'
                        || ch == 'e'
                        || ch == 'E'
                        || (after_exponent && (ch == '-' || ch == '+'))
                    {
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if s == "-" {
                    return Err(VqlError::new("-", "unexpected character"));
                }
                tokens.push(Tok::Num(s));
            }
            '=' => {
                chars.next();
                tokens.push(Tok::Op(CmpOp::Eq));
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Tok::Op(CmpOp::Ne));
                } else {
                    return Err(VqlError::new("!", "unexpected character"));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Tok::Op(CmpOp::Le));
                } else {
                    tokens.push(Tok::Op(CmpOp::Lt));
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Tok::Op(CmpOp::Ge));
                } else {
                    tokens.push(Tok::Op(CmpOp::Gt));
                }
            }
            ',' => {
                chars.next();
                tokens.push(Tok::Comma);
            }
            '(' => {
                chars.next();
                tokens.push(Tok::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Tok::RParen);
            }
            '*' => {
                chars.next();
                tokens.push(Tok::Star);
            }
            other => {
                return Err(VqlError::new(other.to_string(), "unexpected character"));
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(s)) if s.eq_ignore_ascii_case(kw))
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), VqlError> {
        if self.at_keyword(kw) {
            self.pos += 1;
            Ok(())
        } else {
            let token = self.peek().map(Tok::describe).unwrap_or_default();
            Err(VqlError::new(token, format!("expected {kw}")))
        }
    }

    fn expect_column(&mut self) -> Result<String, VqlError> {
        match self.next() {
            Some(Tok::Ident(name)) => {
                if COLUMNS.contains(&name.as_str()) {
                    Ok(name)
                } else {
                    Err(VqlError::new(name, "unknown column"))
                }
            }
            other => {
                let token = other.map(|t| t.describe()).unwrap_or_default();
                Err(VqlError::new(token, "expected a column name"))
            }
        }
    }
}

/// Parse one VQL query, enforcing the whitelist and term limits.
pub fn parse(input: &str) -> Result<Query, VqlError> {
    let tokens = lex(input)?;
    let mut p = Parser { tokens, pos: 0 };

    p.expect_keyword("SELECT")?;

    let projection = if matches!(p.peek(), Some(Tok::Star)) {
        p.next();
        Projection::Star
    } else {
        let mut exprs = Vec::new();
        loop {
            let name = match p.next() {
                Some(Tok::Ident(name)) => name,
                other => {
                    let token = other.map(|t| t.describe()).unwrap_or_default();
                    return Err(VqlError::new(token, "expected a projection expression"));
                }
            };
            if matches!(p.peek(), Some(Tok::LParen)) {
                p.next();
                let func = AggFunc::parse(&name)
                    .ok_or_else(|| VqlError::new(name.clone(), "unknown aggregate function"))?;
                let column = p.expect_column()?;
                match p.next() {
                    Some(Tok::RParen) => {}
                    other => {
                        let token = other.map(|t| t.describe()).unwrap_or_default();
                        return Err(VqlError::new(token, "expected )"));
                    }
                }
                exprs.push(AggExpr::Call { func, column });
            } else {
                if !COLUMNS.contains(&name.as_str()) {
                    return Err(VqlError::new(name, "unknown column"));
                }
                exprs.push(AggExpr::Column(name));
            }
            if matches!(p.peek(), Some(Tok::Comma)) {
                p.next();
            } else {
                break;
            }
        }
        Projection::Exprs(exprs)
    };

    p.expect_keyword("FROM")?;
    match p.next() {
        Some(Tok::Ident(table)) if table == TABLE => {}
        other => {
            let token = other.map(|t| t.describe()).unwrap_or_default();
            return Err(VqlError::new(token, "unknown table"));
        }
    }

    let mut conds = Vec::new();
    if p.at_keyword("WHERE") {
        p.next();
        loop {
            conds.push(parse_cond(&mut p)?);
            if conds.len() > MAX_CONDS {
                return Err(VqlError::new("AND", "too many WHERE terms (max 10)"));
            }
            if p.at_keyword("AND") {
                p.next();
            } else {
                break;
            }
        }
    }

    let mut group_by = Vec::new();
    if p.at_keyword("GROUP") {
        let group_tok = "GROUP".to_string();
        p.next();
        p.expect_keyword("BY")?;
        if matches!(projection, Projection::Star) {
            return Err(VqlError::new(group_tok, "GROUP BY requires an aggregate projection"));
        }
        loop {
            let column = p.expect_column()?;
            if !GROUPABLE.contains(&column.as_str()) {
                return Err(VqlError::new(column, "column cannot be grouped"));
            }
            group_by.push(column);
            if matches!(p.peek(), Some(Tok::Comma)) {
                p.next();
            } else {
                break;
            }
        }
    }

    let mut order_by = None;
    if p.at_keyword("ORDER") {
        p.next();
        p.expect_keyword("BY")?;
        let column = p.expect_column()?;
        let dir = if p.at_keyword("ASC") {
            p.next();
            Some(SortDir::Asc)
        } else if p.at_keyword("DESC") {
            p.next();
            Some(SortDir::Desc)
        } else {
            None
        };
        order_by = Some((column, dir));
    }

    let mut limit = None;
    if p.at_keyword("LIMIT") {
        p.next();
        match p.next() {
            Some(Tok::Num(n)) if !n.contains('.') && !n.starts_with('-') => {
                let value: u64 = n
                    .parse()
                    .map_err(|_| VqlError::new(n.clone(), "invalid LIMIT"))?;
                limit = Some(value);
            }
            other => {
                let token = other.map(|t| t.describe()).unwrap_or_default();
                return Err(VqlError::new(token, "LIMIT takes an unsigned integer"));
            }
        }
    }

    if let Some(extra) = p.peek() {
        return Err(VqlError::new(extra.describe(), "unexpected trailing input"));
    }

    // Aggregate projections may only carry bare columns that are grouped.
    if let Projection::Exprs(exprs) = &projection {
        let has_call = exprs.iter().any(|e| matches!(e, AggExpr::Call { .. }));
        for expr in exprs {
            if let AggExpr::Column(name) = expr {
                if has_call && !group_by.contains(name) {
                    return Err(VqlError::new(
                        name.clone(),
                        "bare column must appear in GROUP BY",
                    ));
                }
            }
        }
        if !group_by.is_empty() && !has_call {
            return Err(VqlError::new(
                "GROUP",
                "GROUP BY requires at least one aggregate function",
            ));
        }
    }

    Ok(Query {
        projection,
        conds,
        group_by,
        order_by,
        limit,
    })
}

fn parse_cond(p: &mut Parser) -> Result<Cond, VqlError> {
    let column = p.expect_column()?;
    let op = match p.next() {
        Some(Tok::Op(op)) => op,
        other => {
            let token = other.map(|t| t.describe()).unwrap_or_default();
            return Err(VqlError::new(token, "expected a comparison operator"));
        }
    };
    let value = match p.next() {
        Some(Tok::Num(n)) => {
            if n.contains(['.', 'e', 'E']) {
                Literal::Float(
                    n.parse()
                        .map_err(|_| VqlError::new(n.clone(), "invalid number"))?,
                )
            } else {
                Literal::Int(
                    n.parse()
                        .map_err(|_| VqlError::new(n.clone(), "invalid number"))?,
                )
            }
        }
        Some(Tok::Str(s)) => Literal::Str(s),
        other => {
            let token = other.map(|t| t.describe()).unwrap_or_default();
            return Err(VqlError::new(token, "expected a literal"));
        }
    };

    let numeric_column = NUMERIC.contains(&column.as_str());
    match (&value, numeric_column) {
        (Literal::Str(_), true) => {
            return Err(VqlError::new(column, "numeric column compared to string"))
        }
        (Literal::Int(_) | Literal::Float(_), false) => {
            return Err(VqlError::new(column, "string column compared to number"))
        }
        _ => {}
    }

    Ok(Cond { column, op, value })
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ExecError {
    Invalid(VqlError),
    Store(StoreError),
}

impl From<StoreError> for ExecError {
    fn from(e: StoreError) -> Self {
        ExecError::Store(e)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Field {
    Int(i64),
    Float(f64),
    Str(String),
    Null,
}

impl Field {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Field::Int(v) => Some(*v as f64),
            Field::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn render(&self) -> String {
        match self {
            Field::Int(v) => v.to_string(),
            Field::Float(v) => format!("{v:?}"),
            Field::Str(s) => s.clone(),
            Field::Null => "null".into(),
        }
    }
}

fn field_of(row: &StoredRow, column: &str) -> Field {
    match column {
        "timestamp" => Field::Int(row.timestamp),
        "service_name" => Field::Str(row.service_name.clone()),
        "metric_name" => Field::Str(row.metric_name.clone()),
        "metric_type" => Field::Str(row.metric_type.as_str().to_string()),
        "value" => Field::Float(row.value),
        "endpoint" => row.endpoint.clone().map(Field::Str).unwrap_or(Field::Null),
        "method" => row.method.clone().map(Field::Str).unwrap_or(Field::Null),
        "status_code" => row
            .status_code
            .map(|c| Field::Int(i64::from(c)))
            .unwrap_or(Field::Null),
        "duration_ms" => row.duration_ms.map(Field::Float).unwrap_or(Field::Null),
        "environment" => row
            .environment
            .clone()
            .map(Field::Str)
            .unwrap_or(Field::Null),
        _ => Field::Null,
    }
}

fn cond_matches(row: &StoredRow, cond: &Cond) -> bool {
    let field = field_of(row, &cond.column);
    match (&field, &cond.value) {
        (Field::Null, _) => cond.op == CmpOp::Ne,
        (Field::Str(actual), Literal::Str(expected)) => compare(actual.as_str(), expected.as_str(), cond.op),
        (field, Literal::Int(v)) => field
            .as_f64()
            .map(|actual| compare_f64(actual, *v as f64, cond.op))
            .unwrap_or(false),
        (field, Literal::Float(v)) => field
            .as_f64()
            .map(|actual| compare_f64(actual, *v, cond.op))
            .unwrap_or(false),
        _ => false,
    }
}

fn compare<T: PartialOrd + PartialEq>(a: T, b: T, op: CmpOp) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
    }
}

fn compare_f64(a: f64, b: f64, op: CmpOp) -> bool {
    compare(a, b, op)
}

/// Derive the scan window from timestamp conditions, defaulting to the
/// last 24 hours.
fn window_of(query: &Query, now_ms: i64) -> TimeWindow {
    let mut start = now_ms - DEFAULT_WINDOW_MS;
    let mut end = now_ms;
    for cond in &query.conds {
        if cond.column != "timestamp" {
            continue;
        }
        let bound = match cond.value {
            Literal::Int(v) => v,
            Literal::Float(v) => v as i64,
            Literal::Str(_) => continue,
        };
        match cond.op {
            CmpOp::Ge => start = bound,
            CmpOp::Gt => start = bound + 1,
            CmpOp::Le => end = bound + 1,
            CmpOp::Lt => end = bound,
            CmpOp::Eq => {
                start = bound;
                end = bound + 1;
            }
            CmpOp::Ne => {}
        }
    }
    TimeWindow::new(start, end)
}

/// Pull equality predicates on indexed-ish columns into the typed filter.
fn filter_of(query: &Query) -> RowFilter {
    let mut filter = RowFilter::default();
    for cond in &query.conds {
        if cond.op != CmpOp::Eq {
            continue;
        }
        if let Literal::Str(value) = &cond.value {
            match cond.column.as_str() {
                "service_name" => filter.service = Some(value.clone()),
                "metric_name" => filter.metric = Some(value.clone()),
                "environment" => filter.environment = Some(value.clone()),
                "endpoint" => filter.endpoint = Some(value.clone()),
                _ => {}
            }
        }
    }
    filter
}

/// Execute a parsed query. Row output for `SELECT *`, one object per group
/// for aggregate projections.
pub async fn execute(
    store: &Store,
    query: &Query,
    now_ms: i64,
) -> Result<Vec<serde_json::Value>, ExecError> {
    let window = window_of(query, now_ms);
    let filter = filter_of(query);

    let mut rows = store
        .query_range(&filter, &window, MAX_LIMIT as usize)
        .await?;
    rows.retain(|row| query.conds.iter().all(|c| cond_matches(row, c)));

    let effective_limit = query.limit.unwrap_or(MAX_LIMIT).min(MAX_LIMIT) as usize;

    match &query.projection {
        Projection::Star => {
            if let Some((column, dir)) = &query.order_by {
                sort_rows_by(&mut rows, column, *dir);
            }
            rows.truncate(effective_limit);
            Ok(rows
                .into_iter()
                .map(|r| serde_json::to_value(&r).unwrap_or_default())
                .collect())
        }
        Projection::Exprs(exprs) => {
            let has_call = exprs.iter().any(|e| matches!(e, AggExpr::Call { .. }));
            if !has_call {
                // Plain column projection over raw rows.
                if let Some((column, dir)) = &query.order_by {
                    sort_rows_by(&mut rows, column, *dir);
                }
                rows.truncate(effective_limit);
                return Ok(rows
                    .iter()
                    .map(|row| {
                        let mut obj = serde_json::Map::new();
                        for expr in exprs {
                            if let AggExpr::Column(name) = expr {
                                obj.insert(name.clone(), field_to_json(&field_of(row, name)));
                            }
                        }
                        serde_json::Value::Object(obj)
                    })
                    .collect());
            }

            let mut groups: BTreeMap<Vec<String>, Vec<&StoredRow>> = BTreeMap::new();
            for row in &rows {
                let key: Vec<String> = query
                    .group_by
                    .iter()
                    .map(|c| field_of(row, c).render())
                    .collect();
                groups.entry(key).or_default().push(row);
            }

            let mut out = Vec::with_capacity(groups.len());
            for (key, members) in groups {
                let mut obj = serde_json::Map::new();
                for (column, value) in query.group_by.iter().zip(key.iter()) {
                    obj.insert(column.clone(), serde_json::Value::String(value.clone()));
                }
                for expr in exprs {
                    if let AggExpr::Call { func, column } = expr {
                        obj.insert(expr.to_string(), aggregate(*func, column, &members));
                    }
                }
                out.push(serde_json::Value::Object(obj));
            }
            out.truncate(effective_limit);
            Ok(out)
        }
    }
}

fn field_to_json(field: &Field) -> serde_json::Value {
    match field {
        Field::Int(v) => serde_json::json!(v),
        Field::Float(v) => serde_json::json!(v),
        Field::Str(s) => serde_json::json!(s),
        Field::Null => serde_json::Value::Null,
    }
}

fn sort_rows_by(rows: &mut [StoredRow], column: &str, dir: Option<SortDir>) {
    rows.sort_by(|a, b| {
        let fa = field_of(a, column);
        let fb = field_of(b, column);
        let ord = match (fa.as_f64(), fb.as_f64()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => fa.render().cmp(&fb.render()),
        };
        match dir {
            Some(SortDir::Desc) => ord.reverse(),
            _ => ord,
        }
    });
}

fn aggregate(func: AggFunc, column: &str, rows: &[&StoredRow]) -> serde_json::Value {
    if func == AggFunc::Count {
        let n: u64 = rows.iter().map(|r| r.observation_count()).sum();
        return serde_json::json!(n);
    }
    let mut values: Vec<f64> = rows
        .iter()
        .filter_map(|r| field_of(r, column).as_f64())
        .collect();
    if values.is_empty() {
        return serde_json::Value::Null;
    }
    let result = match func {
        AggFunc::Avg => values.iter().sum::<f64>() / values.len() as f64,
        AggFunc::Sum => values.iter().sum::<f64>(),
        AggFunc::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggFunc::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggFunc::P50 | AggFunc::P95 | AggFunc::P99 => {
            values.sort_by(|a, b| a.total_cmp(b));
            let q = match func {
                AggFunc::P50 => 0.50,
                AggFunc::P95 => 0.95,
                _ => 0.99,
            };
            quantile_of_sorted(&values, q)
        }
        AggFunc::Count => unreachable!("handled above"),
    };
    serde_json::json!(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_star_query() {
        let q = parse("SELECT * FROM metrics WHERE service_name = 'api' LIMIT 50").unwrap();
        assert_eq!(q.projection, Projection::Star);
        assert_eq!(q.conds.len(), 1);
        assert_eq!(q.conds[0].column, "service_name");
        assert_eq!(q.conds[0].value, Literal::Str("api".into()));
        assert_eq!(q.limit, Some(50));
    }

    #[test]
    fn test_parse_aggregate_with_grouping() {
        let q = parse(
            "SELECT endpoint, AVG(value), P95(duration_ms), COUNT(value) FROM metrics \
             WHERE service_name = 'api' AND status_code >= 500 \
             GROUP BY endpoint ORDER BY endpoint ASC LIMIT 10",
        )
        .unwrap();
        match &q.projection {
            Projection::Exprs(exprs) => assert_eq!(exprs.len(), 4),
            other => panic!("unexpected projection: {other:?}"),
        }
        assert_eq!(q.group_by, vec!["endpoint"]);
        assert_eq!(q.order_by, Some(("endpoint".to_string(), Some(SortDir::Asc))));
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        let q = parse("select * from metrics where value > 1.5").unwrap();
        assert_eq!(q.conds[0].value, Literal::Float(1.5));
    }

    #[test]
    fn test_round_trip_parse_unparse() {
        let cases = [
            "SELECT * FROM metrics",
            "SELECT * FROM metrics WHERE service_name = 'api' AND value > 10 LIMIT 100",
            "SELECT * FROM metrics WHERE value > 1.5 ORDER BY timestamp DESC LIMIT 10",
            "SELECT AVG(value), COUNT(value) FROM metrics WHERE metric_name = 'http.duration'",
            "SELECT endpoint, P99(duration_ms) FROM metrics GROUP BY endpoint ORDER BY endpoint",
            "SELECT * FROM metrics WHERE timestamp >= 1700000000000 AND timestamp < 1700000600000",
            // Tiny floats render in exponent form and must still re-lex.
            "SELECT * FROM metrics WHERE value > 0.00000001",
        ];
        for case in cases {
            let q = parse(case).unwrap();
            let rendered = q.to_string();
            let reparsed = parse(&rendered)
                .unwrap_or_else(|e| panic!("reparse of `{rendered}` failed: {e}"));
            assert_eq!(reparsed, q, "round trip failed for `{case}`");
        }
    }

    #[test]
    fn test_rejects_semicolon_with_offending_token() {
        let err = parse("SELECT * FROM metrics; DROP TABLE metrics").unwrap_err();
        assert_eq!(err.token, ";");
    }

    #[test]
    fn test_rejects_write_keywords() {
        for stmt in [
            "INSERT INTO metrics VALUES (1)",
            "DELETE FROM metrics",
            "SELECT * FROM metrics WHERE service_name = 'a' AND DROP",
            "UPDATE metrics",
            "TRUNCATE metrics",
        ] {
            let err = parse(stmt).unwrap_err();
            assert!(
                FORBIDDEN.contains(&err.token.to_ascii_uppercase().as_str()),
                "expected a forbidden-keyword token for `{stmt}`, got `{}`",
                err.token
            );
        }
    }

    #[test]
    fn test_semicolon_inside_literal_is_data() {
        let q = parse("SELECT * FROM metrics WHERE endpoint = '/a;b'").unwrap();
        assert_eq!(q.conds[0].value, Literal::Str("/a;b".into()));
    }

    #[test]
    fn test_rejects_unknown_table_and_column() {
        assert_eq!(parse("SELECT * FROM users").unwrap_err().token, "users");
        assert_eq!(
            parse("SELECT * FROM metrics WHERE password = 'x'")
                .unwrap_err()
                .token,
            "password"
        );
    }

    #[test]
    fn test_rejects_too_many_where_terms() {
        let conds: Vec<String> = (0..11).map(|i| format!("value > {i}")).collect();
        let stmt = format!("SELECT * FROM metrics WHERE {}", conds.join(" AND "));
        let err = parse(&stmt).unwrap_err();
        assert!(err.message.contains("too many"));
    }

    #[test]
    fn test_rejects_type_mismatches() {
        assert!(parse("SELECT * FROM metrics WHERE value = 'high'").is_err());
        assert!(parse("SELECT * FROM metrics WHERE service_name = 42").is_err());
    }

    #[test]
    fn test_rejects_group_by_star() {
        let err = parse("SELECT * FROM metrics GROUP BY endpoint").unwrap_err();
        assert!(err.message.contains("aggregate"));
    }

    #[test]
    fn test_rejects_bare_column_outside_group_by() {
        let err = parse("SELECT endpoint, AVG(value) FROM metrics GROUP BY method").unwrap_err();
        assert_eq!(err.token, "endpoint");
    }

    #[test]
    fn test_rejects_trailing_garbage() {
        let err = parse("SELECT * FROM metrics LIMIT 5 LIMIT 6").unwrap_err();
        assert_eq!(err.token, "LIMIT");
    }

    #[test]
    fn test_window_extraction() {
        let q = parse(
            "SELECT * FROM metrics WHERE timestamp >= 1000 AND timestamp < 2000",
        )
        .unwrap();
        let window = window_of(&q, 1_000_000);
        assert_eq!(window.start_ms, 1_000);
        assert_eq!(window.end_ms, 2_000);
    }

    #[test]
    fn test_default_window_is_last_day() {
        let q = parse("SELECT * FROM metrics").unwrap();
        let window = window_of(&q, 1_000_000_000);
        assert_eq!(window.end_ms, 1_000_000_000);
        assert_eq!(window.start_ms, 1_000_000_000 - DEFAULT_WINDOW_MS);
    }

    #[test]
    fn test_filter_extraction_only_from_equality() {
        let q = parse(
            "SELECT * FROM metrics WHERE service_name = 'api' AND endpoint != '/health'",
        )
        .unwrap();
        let filter = filter_of(&q);
        assert_eq!(filter.service.as_deref(), Some("api"));
        assert!(filter.endpoint.is_none());
    }
}
