//! A small SQL tokenizer for the restricted SELECT grammar the rewriter
//! understands. Mirrors the reference implementation's choice (in
//! `src/dvm/parser.rs`) to own its parse representation rather than bind to
//! an external parser's AST — here we also own lexing, since this engine
//! runs outside a Postgres process and has no raw parser to borrow.

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// An unquoted identifier or keyword, original case preserved.
    Word(String),
    /// A double-quoted identifier; preserves the inner text verbatim.
    QuotedIdent(String),
    /// A numeric literal, kept as source text.
    Number(String),
    /// A single-quoted string literal, kept with escaping untouched.
    Str(String),
    /// Punctuation: one of `( ) , . *`.
    Punct(char),
    /// A comparison/arithmetic operator, possibly multi-char (`<= >= <> != ||`).
    Op(String),
}

impl Token {
    pub fn is_word(&self, w: &str) -> bool {
        matches!(self, Token::Word(s) if s.eq_ignore_ascii_case(w))
    }
}

pub fn tokenize(sql: &str) -> Result<Vec<Token>, EngineError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;
    let mut out = Vec::new();

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // Line comment.
        if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        // Block comment.
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i += 2;
            continue;
        }

        if c == '"' {
            let mut s = String::new();
            i += 1;
            while i < chars.len() && chars[i] != '"' {
                s.push(chars[i]);
                i += 1;
            }
            if i >= chars.len() {
                return Err(EngineError::QueryParseError(
                    "unterminated quoted identifier".into(),
                ));
            }
            i += 1;
            out.push(Token::QuotedIdent(s));
            continue;
        }

        if c == '\'' {
            let mut s = String::new();
            i += 1;
            loop {
                if i >= chars.len() {
                    return Err(EngineError::QueryParseError(
                        "unterminated string literal".into(),
                    ));
                }
                if chars[i] == '\'' {
                    if chars.get(i + 1) == Some(&'\'') {
                        s.push('\'');
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                s.push(chars[i]);
                i += 1;
            }
            out.push(Token::Str(s));
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            out.push(Token::Number(chars[start..i].iter().collect()));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            out.push(Token::Word(chars[start..i].iter().collect()));
            continue;
        }

        if matches!(c, '(' | ')' | ',' | '.' | '*') {
            out.push(Token::Punct(c));
            i += 1;
            continue;
        }

        // Multi-char operators.
        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        if matches!(two.as_str(), "<=" | ">=" | "<>" | "!=" | "||") {
            out.push(Token::Op(two));
            i += 2;
            continue;
        }

        if matches!(c, '<' | '>' | '=' | '+' | '-' | '/' | '%') {
            out.push(Token::Op(c.to_string()));
            i += 1;
            continue;
        }

        return Err(EngineError::QueryParseError(format!(
            "unexpected character '{c}' at offset {i}"
        )));
    }

    Ok(out)
}
