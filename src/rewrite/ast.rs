//! The restricted SELECT AST the rewriter operates on.
//!
//! Only the clauses the rewriter must actually inspect or mutate — the
//! source list (for snapshot pinning) and the WHERE clause (for predicate
//! injection) — are structured. Everything else (projection items, GROUP BY,
//! HAVING, ORDER BY, LIMIT) is kept as an opaque, faithfully re-emitted token
//! span, since the rewriter never needs to reason about their shape. This
//! mirrors the reference implementation's `dvm/parser.rs`, which likewise
//! only builds structure for the parts its operators actually rewrite.

use super::tokenizer::Token;

#[derive(Debug, Clone)]
pub struct Query {
    pub with: Vec<CteDef>,
    pub recursive: bool,
    pub body: SetExpr,
}

#[derive(Debug, Clone)]
pub struct CteDef {
    pub name: String,
    pub query: Box<SetExpr>,
}

/// A SELECT possibly combined with UNION/INTERSECT/EXCEPT.
#[derive(Debug, Clone)]
pub enum SetExpr {
    Select(Box<Select>),
    SetOp {
        op: SetOpKind,
        all: bool,
        left: Box<SetExpr>,
        right: Box<SetExpr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpKind {
    Union,
    Intersect,
    Except,
}

#[derive(Debug, Clone)]
pub struct Select {
    pub distinct: Distinct,
    /// Raw projection item tokens, comma-split, kept opaque.
    pub projection: Vec<Vec<Token>>,
    pub from: Vec<TableWithJoins>,
    pub selection: Option<Vec<Token>>,
    pub group_by: Option<Vec<Token>>,
    pub having: Option<Vec<Token>>,
    /// ORDER BY / LIMIT / OFFSET immediately trailing this atomic SELECT,
    /// kept opaque and re-emitted verbatim in place.
    pub tail: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Distinct {
    None,
    All,
    /// `DISTINCT ON (...)` — the column-list tokens, kept opaque.
    On(Vec<Token>),
}

#[derive(Debug, Clone)]
pub struct TableWithJoins {
    pub relation: TableFactor,
    pub joins: Vec<Join>,
}

#[derive(Debug, Clone)]
pub enum TableFactor {
    Table {
        schema: Option<String>,
        name: String,
        alias: Option<String>,
        /// Snapshot id this occurrence is pinned to, set by the rewriter's
        /// pin-injection pass; absent until then.
        pin: Option<String>,
    },
    Derived {
        subquery: Box<SetExpr>,
        alias: Option<String>,
    },
}

impl TableFactor {
    pub fn alias(&self) -> Option<&str> {
        match self {
            TableFactor::Table { alias, .. } => alias.as_deref(),
            TableFactor::Derived { alias, .. } => alias.as_deref(),
        }
    }

    pub fn table_name(&self) -> Option<(Option<&str>, &str)> {
        match self {
            TableFactor::Table { schema, name, .. } => Some((schema.as_deref(), name.as_str())),
            TableFactor::Derived { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone)]
pub struct Join {
    pub relation: TableFactor,
    pub kind: JoinKind,
    pub on: Option<Vec<Token>>,
}
