//! Renders the AST back to SQL text. The only step that touches string
//! concatenation directly — everything upstream of this module works on the
//! typed AST, per the "rewriting is AST->AST, rendering is a single final
//! step" design this engine follows for snapshot pins and predicates.

use super::ast::*;
use super::tokenizer::Token;

pub fn render_query(q: &Query) -> String {
    let mut out = String::new();
    if !q.with.is_empty() {
        out.push_str("WITH ");
        if q.recursive {
            out.push_str("RECURSIVE ");
        }
        let parts: Vec<String> = q
            .with
            .iter()
            .map(|c| format!("{} AS ({})", c.name, render_set_expr(&c.query)))
            .collect();
        out.push_str(&parts.join(", "));
        out.push(' ');
    }
    out.push_str(&render_set_expr(&q.body));
    out
}

fn render_set_expr(e: &SetExpr) -> String {
    match e {
        SetExpr::Select(s) => render_select(s),
        SetExpr::SetOp {
            op,
            all,
            left,
            right,
        } => {
            let op_str = match op {
                SetOpKind::Union => "UNION",
                SetOpKind::Intersect => "INTERSECT",
                SetOpKind::Except => "EXCEPT",
            };
            format!(
                "{} {}{} {}",
                render_set_expr(left),
                op_str,
                if *all { " ALL" } else { "" },
                render_set_expr(right)
            )
        }
    }
}

fn render_select(s: &Select) -> String {
    let mut out = String::from("SELECT ");
    match &s.distinct {
        Distinct::None => {}
        Distinct::All => out.push_str("DISTINCT "),
        Distinct::On(cols) => {
            out.push_str("DISTINCT ON (");
            out.push_str(&render_tokens(cols));
            out.push_str(") ");
        }
    }

    let items: Vec<String> = s.projection.iter().map(|t| render_tokens(t)).collect();
    out.push_str(&items.join(", "));

    if !s.from.is_empty() {
        out.push_str(" FROM ");
        let tables: Vec<String> = s.from.iter().map(render_table_with_joins).collect();
        out.push_str(&tables.join(", "));
    }

    if let Some(sel) = &s.selection {
        out.push_str(" WHERE ");
        out.push_str(&render_tokens(sel));
    }
    if let Some(gb) = &s.group_by {
        out.push_str(" GROUP BY ");
        out.push_str(&render_tokens(gb));
    }
    if let Some(h) = &s.having {
        out.push_str(" HAVING ");
        out.push_str(&render_tokens(h));
    }
    if !s.tail.is_empty() {
        out.push(' ');
        out.push_str(&render_tokens(&s.tail));
    }
    out
}

fn render_table_with_joins(twj: &TableWithJoins) -> String {
    let mut out = render_table_factor(&twj.relation);
    for j in &twj.joins {
        let kw = match j.kind {
            JoinKind::Inner => "JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Full => "FULL JOIN",
            JoinKind::Cross => "CROSS JOIN",
        };
        out.push(' ');
        out.push_str(kw);
        out.push(' ');
        out.push_str(&render_table_factor(&j.relation));
        if let Some(on) = &j.on {
            out.push_str(" ON ");
            out.push_str(&render_tokens(on));
        }
    }
    out
}

fn render_table_factor(tf: &TableFactor) -> String {
    match tf {
        TableFactor::Table {
            schema,
            name,
            alias,
            pin,
        } => {
            let mut s = match schema {
                Some(sch) => format!("{sch}.{name}"),
                None => name.clone(),
            };
            if let Some(snapshot_id) = pin {
                s.push_str(&format!(" AS OF SNAPSHOT '{snapshot_id}'"));
            }
            if let Some(a) = alias {
                s.push_str(" AS ");
                s.push_str(a);
            }
            s
        }
        TableFactor::Derived { subquery, alias } => {
            let mut s = format!("({})", render_set_expr(subquery));
            if let Some(a) = alias {
                s.push_str(" AS ");
                s.push_str(a);
            }
            s
        }
    }
}

pub fn render_tokens(tokens: &[Token]) -> String {
    let mut out = String::new();
    for (i, tok) in tokens.iter().enumerate() {
        if i > 0 && needs_space(&tokens[i - 1], tok) {
            out.push(' ');
        }
        out.push_str(&token_text(tok));
    }
    out
}

fn needs_space(prev: &Token, cur: &Token) -> bool {
    match (prev, cur) {
        (Token::Punct('('), _) => false,
        (_, Token::Punct(')')) => false,
        (_, Token::Punct(',')) => false,
        (_, Token::Punct('.')) => false,
        (Token::Punct('.'), _) => false,
        _ => true,
    }
}

fn token_text(tok: &Token) -> String {
    match tok {
        Token::Word(w) => w.clone(),
        Token::QuotedIdent(s) => format!("\"{s}\""),
        Token::Number(s) => s.clone(),
        Token::Str(s) => format!("'{}'", s.replace('\'', "''")),
        Token::Punct(c) => c.to_string(),
        Token::Op(s) => s.clone(),
    }
}
