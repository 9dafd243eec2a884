//! The Query Rewriter (spec section on snapshot pinning and affected-key
//! predicate injection): a pure, deterministic transform from a parsed
//! definition query plus a source->snapshot map into a semantically
//! equivalent query with every base-source occurrence pinned, and,
//! optionally, an affected-keys predicate AND-combined into the outer
//! WHERE clause.
//!
//! The AST is a small set of types (`ast::{Select, TableRef, JoinClause,
//! Expr}`-shaped) built by a hand-rolled tokenizer and recursive-descent
//! parser over the restricted SELECT grammar this engine needs to
//! understand, the same approach the reference implementation's own
//! differential-view parser takes rather than depending on an external
//! SQL-parser crate — rewriting is AST -> AST and rendering is a single
//! final step, so string-building never touches a pin or predicate value.

pub mod ast;
pub mod parser;
pub mod render;
pub mod tokenizer;

use std::collections::{HashMap, HashSet};

use crate::error::EngineError;
use crate::model::QualifiedName;
use ast::{Join, Select, SetExpr, TableFactor, TableWithJoins};
use tokenizer::{tokenize, Token};

pub use ast::Query;

/// Parse a definition query into the rewriter's AST.
pub fn parse(sql: &str) -> Result<Query, EngineError> {
    parser::parse_query(sql)
}

/// Render an AST back to SQL text.
pub fn render(query: &Query) -> String {
    render::render_query(query)
}

/// Collect every base-source qualified name referenced anywhere in the
/// query (top-level FROM, JOINs including self-joins, and nested
/// subqueries), excluding names bound by a CTE (spec: "CTE-defined names
/// are NOT pinned").
pub fn extract_source_refs(query: &Query) -> HashSet<QualifiedName> {
    let cte_names: HashSet<String> = query.with.iter().map(|c| c.name.clone()).collect();
    let mut out = HashSet::new();
    for cte in &query.with {
        collect_refs(&cte.query, &cte_names, &mut out);
    }
    collect_refs(&query.body, &cte_names, &mut out);
    out
}

fn collect_refs(expr: &SetExpr, cte_names: &HashSet<String>, out: &mut HashSet<QualifiedName>) {
    match expr {
        SetExpr::Select(s) => {
            for twj in &s.from {
                collect_refs_table_factor(&twj.relation, cte_names, out);
                for j in &twj.joins {
                    collect_refs_table_factor(&j.relation, cte_names, out);
                }
            }
        }
        SetExpr::SetOp { left, right, .. } => {
            collect_refs(left, cte_names, out);
            collect_refs(right, cte_names, out);
        }
    }
}

fn collect_refs_table_factor(
    tf: &TableFactor,
    cte_names: &HashSet<String>,
    out: &mut HashSet<QualifiedName>,
) {
    match tf {
        TableFactor::Table { schema, name, .. } => {
            if !cte_names.contains(name) {
                out.insert(QualifiedName::new(
                    schema.clone().unwrap_or_else(|| "public".to_string()),
                    name.clone(),
                ));
            }
        }
        TableFactor::Derived { subquery, .. } => collect_refs(subquery, cte_names, out),
    }
}

/// Inject a snapshot pin (`AS OF SNAPSHOT '<id>'`) onto every occurrence of
/// each source named in `pins`, everywhere it appears — top-level FROM,
/// JOINs, and nested subqueries — except references to CTE-bound names.
pub fn pin_snapshots(mut query: Query, pins: &HashMap<QualifiedName, String>) -> Query {
    let cte_names: HashSet<String> = query.with.iter().map(|c| c.name.clone()).collect();
    for cte in &mut query.with {
        pin_tree(&mut cte.query, pins, &cte_names);
    }
    pin_tree(&mut query.body, pins, &cte_names);
    query
}

fn pin_tree(expr: &mut SetExpr, pins: &HashMap<QualifiedName, String>, cte_names: &HashSet<String>) {
    match expr {
        SetExpr::Select(s) => {
            for twj in &mut s.from {
                pin_table_with_joins(twj, pins, cte_names);
            }
        }
        SetExpr::SetOp { left, right, .. } => {
            pin_tree(left, pins, cte_names);
            pin_tree(right, pins, cte_names);
        }
    }
}

fn pin_table_with_joins(
    twj: &mut TableWithJoins,
    pins: &HashMap<QualifiedName, String>,
    cte_names: &HashSet<String>,
) {
    pin_table_factor(&mut twj.relation, pins, cte_names);
    for j in &mut twj.joins {
        pin_table_factor(&mut j.relation, pins, cte_names);
    }
}

fn pin_table_factor(
    tf: &mut TableFactor,
    pins: &HashMap<QualifiedName, String>,
    cte_names: &HashSet<String>,
) {
    match tf {
        TableFactor::Table {
            schema, name, pin, ..
        } => {
            if cte_names.contains(name) {
                return;
            }
            let qn = QualifiedName::new(
                schema.clone().unwrap_or_else(|| "public".to_string()),
                name.clone(),
            );
            if let Some(snapshot_id) = pins.get(&qn) {
                *pin = Some(snapshot_id.clone());
            }
        }
        TableFactor::Derived { subquery, .. } => pin_tree(subquery, pins, cte_names),
    }
}

/// AND-combine `predicate_sql` into the outer query's WHERE clause (spec:
/// "AND-combine a predicate `grouping_keys ∈ affected_keys`"). Only valid
/// when the query body is a single SELECT — set operations combined with
/// the affected-keys strategy are rejected upstream by [`check_unsupported`]
/// and this function mirrors that restriction defensively.
pub fn add_predicate(mut query: Query, predicate_sql: &str) -> Result<Query, EngineError> {
    let pred_tokens = tokenize(predicate_sql)?;
    match &mut query.body {
        SetExpr::Select(sel) => {
            sel.selection = Some(and_combine(sel.selection.take(), pred_tokens));
            Ok(query)
        }
        SetExpr::SetOp { .. } => Err(EngineError::UnsupportedConstruct {
            strategy: "affected_keys".to_string(),
            detail: "set operations cannot carry an affected-keys predicate".to_string(),
        }),
    }
}

fn and_combine(existing: Option<Vec<Token>>, addition: Vec<Token>) -> Vec<Token> {
    match existing {
        None => addition,
        Some(existing) => {
            let mut out = vec![Token::Punct('(')];
            out.extend(existing);
            out.push(Token::Punct(')'));
            out.push(Token::Word("AND".to_string()));
            out.push(Token::Punct('('));
            out.extend(addition);
            out.push(Token::Punct(')'));
            out
        }
    }
}

/// Non-deterministic functions that must not appear in the projection of a
/// definition driving the affected-keys strategy (each reapplication of the
/// incremental path would otherwise produce different output per row).
const NONDETERMINISTIC_FNS: &[&str] = &[
    "RANDOM",
    "NOW",
    "CLOCK_TIMESTAMP",
    "CURRENT_TIMESTAMP",
    "GEN_RANDOM_UUID",
    "STATEMENT_TIMESTAMP",
];

/// Reject query shapes the given strategy cannot correctly execute.
pub fn check_unsupported(query: &Query, strategy: &str) -> Result<(), EngineError> {
    let unsupported = |detail: &str| {
        Err(EngineError::UnsupportedConstruct {
            strategy: strategy.to_string(),
            detail: detail.to_string(),
        })
    };

    if strategy == "affected_keys" || strategy == "parallel_affected_keys" {
        if query.recursive {
            return unsupported("recursive CTEs cannot be combined with the affected-keys strategy");
        }
        if matches!(query.body, SetExpr::SetOp { .. }) {
            return unsupported("set operations cannot be combined with the affected-keys strategy");
        }
        if let SetExpr::Select(sel) = &query.body {
            if !matches!(sel.distinct, ast::Distinct::None) && sel.group_by.is_none() {
                return unsupported("DISTINCT without GROUP BY cannot be combined with the affected-keys strategy");
            }
        }
    }

    check_select_tree(&query.body, strategy)
}

fn check_select_tree(expr: &SetExpr, strategy: &str) -> Result<(), EngineError> {
    match expr {
        SetExpr::Select(s) => check_select(s, strategy),
        SetExpr::SetOp { left, right, .. } => {
            check_select_tree(left, strategy)?;
            check_select_tree(right, strategy)
        }
    }
}

fn check_select(s: &Select, strategy: &str) -> Result<(), EngineError> {
    let has_order_by = s.tail.iter().any(|t| t.is_word("ORDER"));
    let has_limit = s.tail.iter().any(|t| t.is_word("LIMIT"));
    if has_limit && !has_order_by {
        return Err(EngineError::UnsupportedConstruct {
            strategy: strategy.to_string(),
            detail: "LIMIT without ORDER BY produces a nondeterministic result set".to_string(),
        });
    }

    for item in &s.projection {
        if let Some(detail) = check_window_function(item) {
            return Err(EngineError::UnsupportedConstruct {
                strategy: strategy.to_string(),
                detail,
            });
        }
        if strategy == "affected_keys" || strategy == "parallel_affected_keys" {
            if let Some(f) = item.iter().find_map(|t| match t {
                Token::Word(w) if NONDETERMINISTIC_FNS.contains(&w.to_uppercase().as_str()) => {
                    Some(w.clone())
                }
                _ => None,
            }) {
                return Err(EngineError::UnsupportedConstruct {
                    strategy: strategy.to_string(),
                    detail: format!("non-deterministic function {f} in projection"),
                });
            }
        }
    }

    for twj in &s.from {
        check_table_factor(&twj.relation, strategy)?;
        for j in &twj.joins {
            check_table_factor(&j.relation, strategy)?;
        }
    }
    Ok(())
}

fn check_table_factor(tf: &TableFactor, strategy: &str) -> Result<(), EngineError> {
    if let TableFactor::Derived { subquery, .. } = tf {
        return check_select_tree(subquery, strategy);
    }
    Ok(())
}

/// Window functions (`... OVER (...)`) without a `PARTITION BY` clause
/// aggregate across the whole result set, which the affected-keys and
/// parallel-affected-keys strategies cannot compute correctly per-key.
fn check_window_function(item: &[Token]) -> Option<String> {
    let mut i = 0;
    while i < item.len() {
        if item[i].is_word("OVER") {
            if let Some(Token::Punct('(')) = item.get(i + 1) {
                let mut depth = 0i32;
                let mut j = i + 1;
                let mut has_partition = false;
                loop {
                    match item.get(j) {
                        Some(Token::Punct('(')) => depth += 1,
                        Some(Token::Punct(')')) => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        Some(t) if t.is_word("PARTITION") => has_partition = true,
                        None => break,
                        _ => {}
                    }
                    j += 1;
                }
                if !has_partition {
                    return Some("window function without PARTITION BY".to_string());
                }
            }
        }
        i += 1;
    }
    None
}
