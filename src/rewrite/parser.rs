//! Recursive-descent parser over the restricted SELECT grammar: SELECT list,
//! FROM/JOIN with aliases and nested subqueries, CTEs, WHERE, GROUP BY,
//! HAVING, ORDER BY, LIMIT. Builds the typed AST in `super::ast`; everything
//! the rewriter does not need to mutate is retained as an opaque token span.

use super::ast::*;
use super::tokenizer::{tokenize, Token};
use crate::error::EngineError;

const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "GROUP", "HAVING", "ORDER", "LIMIT", "OFFSET", "UNION", "INTERSECT", "EXCEPT",
];
const JOIN_KEYWORDS: &[&str] = &["JOIN", "INNER", "LEFT", "RIGHT", "FULL", "CROSS"];

pub fn parse_query(sql: &str) -> Result<Query, EngineError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let toks = tokenize(trimmed)?;
    let mut p = Parser { toks: &toks, pos: 0 };
    let query = p.parse_query()?;
    if p.pos != p.toks.len() {
        return Err(EngineError::QueryParseError(format!(
            "unexpected trailing input at token {}",
            p.pos
        )));
    }
    Ok(query)
}

struct Parser<'t> {
    toks: &'t [Token],
    pos: usize,
}

impl<'t> Parser<'t> {
    fn peek(&self) -> Option<&Token> {
        self.toks.get(self.pos)
    }

    fn peek_word(&self, w: &str) -> bool {
        matches!(self.peek(), Some(t) if t.is_word(w))
    }

    fn peek_word_any(&self, ws: &[&str]) -> bool {
        matches!(self.peek(), Some(Token::Word(s)) if ws.iter().any(|w| s.eq_ignore_ascii_case(w)))
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat_word(&mut self, w: &str) -> bool {
        if self.peek_word(w) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if matches!(self.peek(), Some(Token::Punct(p)) if *p == c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_word(&mut self, w: &str) -> Result<(), EngineError> {
        if self.eat_word(w) {
            Ok(())
        } else {
            Err(EngineError::QueryParseError(format!(
                "expected '{w}' at token {}",
                self.pos
            )))
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<(), EngineError> {
        if self.eat_punct(c) {
            Ok(())
        } else {
            Err(EngineError::QueryParseError(format!(
                "expected '{c}' at token {}",
                self.pos
            )))
        }
    }

    fn expect_ident(&mut self) -> Result<String, EngineError> {
        match self.advance() {
            Some(Token::Word(w)) => Ok(w),
            Some(Token::QuotedIdent(w)) => Ok(w),
            other => Err(EngineError::QueryParseError(format!(
                "expected identifier, found {other:?}"
            ))),
        }
    }

    /// Collect tokens up to (not including) the first top-level occurrence
    /// of one of `stops`, or a top-level comma if `stop_at_comma`, or a
    /// top-level closing paren, or end of input.
    fn collect_until(&mut self, stops: &[&str], stop_at_comma: bool) -> Vec<Token> {
        let mut depth = 0i32;
        let mut out = Vec::new();
        while let Some(tok) = self.peek() {
            if depth == 0 {
                if let Token::Word(w) = tok {
                    if stops.iter().any(|s| w.eq_ignore_ascii_case(s)) {
                        break;
                    }
                }
                if stop_at_comma && matches!(tok, Token::Punct(',')) {
                    break;
                }
                if matches!(tok, Token::Punct(')')) {
                    break;
                }
            }
            match tok {
                Token::Punct('(') => depth += 1,
                Token::Punct(')') => depth -= 1,
                _ => {}
            }
            out.push(tok.clone());
            self.pos += 1;
        }
        out
    }

    fn parse_query(&mut self) -> Result<Query, EngineError> {
        let mut with = Vec::new();
        let mut recursive = false;
        if self.eat_word("WITH") {
            if self.eat_word("RECURSIVE") {
                recursive = true;
            }
            loop {
                let name = self.expect_ident()?;
                self.expect_word("AS")?;
                self.expect_punct('(')?;
                let query = self.parse_set_expr()?;
                self.expect_punct(')')?;
                with.push(CteDef {
                    name,
                    query: Box::new(query),
                });
                if !self.eat_punct(',') {
                    break;
                }
            }
        }
        let body = self.parse_set_expr()?;
        Ok(Query {
            with,
            recursive,
            body,
        })
    }

    fn parse_set_expr(&mut self) -> Result<SetExpr, EngineError> {
        let mut left = self.parse_select_core()?;
        loop {
            let op = if self.peek_word("UNION") {
                SetOpKind::Union
            } else if self.peek_word("INTERSECT") {
                SetOpKind::Intersect
            } else if self.peek_word("EXCEPT") {
                SetOpKind::Except
            } else {
                break;
            };
            self.pos += 1;
            let all = self.eat_word("ALL");
            self.eat_word("DISTINCT");
            let right = self.parse_select_core()?;
            left = SetExpr::SetOp {
                op,
                all,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_select_core(&mut self) -> Result<SetExpr, EngineError> {
        if self.eat_punct('(') {
            let inner = self.parse_set_expr()?;
            self.expect_punct(')')?;
            return Ok(inner);
        }

        self.expect_word("SELECT")?;

        let distinct = if self.eat_word("DISTINCT") {
            if self.eat_word("ON") {
                self.expect_punct('(')?;
                let cols = self.collect_until(&[], false);
                self.expect_punct(')')?;
                Distinct::On(cols)
            } else {
                Distinct::All
            }
        } else {
            self.eat_word("ALL");
            Distinct::None
        };

        let projection = self.parse_projection()?;

        let mut from = Vec::new();
        if self.eat_word("FROM") {
            from = self.parse_table_ref_list()?;
        }

        let selection = if self.eat_word("WHERE") {
            Some(self.collect_until(CLAUSE_KEYWORDS, false))
        } else {
            None
        };

        let group_by = if self.eat_word("GROUP") {
            self.expect_word("BY")?;
            Some(self.collect_until(CLAUSE_KEYWORDS, false))
        } else {
            None
        };

        let having = if self.eat_word("HAVING") {
            Some(self.collect_until(CLAUSE_KEYWORDS, false))
        } else {
            None
        };

        // ORDER BY / LIMIT / OFFSET trailing this atomic select, stopping at
        // a set-operator keyword or the enclosing paren.
        let tail = self.collect_until(&["UNION", "INTERSECT", "EXCEPT"], false);

        Ok(SetExpr::Select(Box::new(Select {
            distinct,
            projection,
            from,
            selection,
            group_by,
            having,
            tail,
        })))
    }

    fn parse_projection(&mut self) -> Result<Vec<Vec<Token>>, EngineError> {
        let mut items = Vec::new();
        loop {
            let item = self.collect_until(&["FROM"], true);
            if item.is_empty() {
                return Err(EngineError::QueryParseError(
                    "empty projection item".to_string(),
                ));
            }
            items.push(item);
            if !self.eat_punct(',') {
                break;
            }
        }
        Ok(items)
    }

    fn parse_table_ref_list(&mut self) -> Result<Vec<TableWithJoins>, EngineError> {
        let mut list = vec![self.parse_table_with_joins()?];
        while self.eat_punct(',') {
            list.push(self.parse_table_with_joins()?);
        }
        Ok(list)
    }

    fn parse_table_with_joins(&mut self) -> Result<TableWithJoins, EngineError> {
        let relation = self.parse_table_factor()?;
        let mut joins = Vec::new();
        loop {
            let kind = if self.eat_word("CROSS") {
                self.expect_word("JOIN")?;
                JoinKind::Cross
            } else if self.eat_word("INNER") {
                self.expect_word("JOIN")?;
                JoinKind::Inner
            } else if self.eat_word("LEFT") {
                self.eat_word("OUTER");
                self.expect_word("JOIN")?;
                JoinKind::Left
            } else if self.eat_word("RIGHT") {
                self.eat_word("OUTER");
                self.expect_word("JOIN")?;
                JoinKind::Right
            } else if self.eat_word("FULL") {
                self.eat_word("OUTER");
                self.expect_word("JOIN")?;
                JoinKind::Full
            } else if self.eat_word("JOIN") {
                JoinKind::Inner
            } else {
                break;
            };

            let rel2 = self.parse_table_factor()?;
            let on = if kind != JoinKind::Cross && self.eat_word("ON") {
                let mut stops = JOIN_KEYWORDS.to_vec();
                stops.extend_from_slice(CLAUSE_KEYWORDS);
                Some(self.collect_until(&stops, true))
            } else {
                None
            };
            joins.push(Join {
                relation: rel2,
                kind,
                on,
            });
        }
        Ok(TableWithJoins { relation, joins })
    }

    fn parse_table_factor(&mut self) -> Result<TableFactor, EngineError> {
        if self.eat_punct('(') {
            let sub = self.parse_set_expr()?;
            self.expect_punct(')')?;
            let alias = self.parse_opt_alias();
            return Ok(TableFactor::Derived {
                subquery: Box::new(sub),
                alias,
            });
        }

        let first = self.expect_ident()?;
        let (schema, name) = if self.eat_punct('.') {
            (Some(first), self.expect_ident()?)
        } else {
            (None, first)
        };
        let alias = self.parse_opt_alias();
        Ok(TableFactor::Table {
            schema,
            name,
            alias,
            pin: None,
        })
    }

    fn parse_opt_alias(&mut self) -> Option<String> {
        if self.eat_word("AS") {
            return self.expect_ident().ok();
        }
        if let Some(Token::Word(w)) = self.peek() {
            let reserved = JOIN_KEYWORDS
                .iter()
                .chain(CLAUSE_KEYWORDS)
                .chain(["ON", "AS"].iter())
                .any(|k| w.eq_ignore_ascii_case(k));
            if !reserved {
                let w = w.clone();
                self.pos += 1;
                return Some(w);
            }
        }
        None
    }
}
