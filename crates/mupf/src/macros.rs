//! # Script Preprocessor
//!
//! C-like conditional sections for the bundled JavaScript, driven by feature
//! names. Directives live in line comments so the unprocessed file is still
//! valid script:
//!
//! ```text
//! // #if garbage_collection & ~friendly_obj_names
//! delete this._byid[id]
//! // #else
//! // #endif
//! ```
//!
//! | Directive | Effect |
//! |---|---|
//! | `#if expr` | keep following lines when `expr` is non-zero |
//! | `#else` | flip the innermost `#if` |
//! | `#endif` | close the innermost `#if` |
//! | `#define a, ~b` | add label `a`, remove label `b` |
//! | `#print_features_state` | emit `name:true, name:false, ...` |
//! | `#` | comment, dropped |
//!
//! In expressions a feature name is `1` when enabled and `0` otherwise.
//! Operators are `~` (or `!`), `&` (or `&&`), `|` (or `||`), comparisons,
//! `+ - *`, integers and parentheses.
//!
//! With `verbose_macros` on, directive lines are kept and excluded lines are
//! commented out instead of dropped, so line numbers in the page match.

use std::collections::BTreeSet;

use crate::error::Error;
use crate::error::Result;
use crate::features::Features;
use crate::features::VERBOSE_MACROS;

/// Expands `source` with the labels enabled in `features`.
pub fn expand(source: &str, features: &Features) -> Result<String> {
    let mut labels = features.enabled();
    let mut out = String::with_capacity(source.len());
    let mut active = true;
    let mut stack: Vec<(bool, bool)> = Vec::new();

    for (idx, line) in source.split_inclusive('\n').enumerate() {
        let lineno = idx + 1;
        let verbose = labels.contains(VERBOSE_MACROS);
        let Some((directive, argument)) = parse_directive(line) else {
            if active {
                out.push_str(line);
            } else if verbose {
                let (indent, rest) = split_indent(line);
                out.push_str(indent);
                out.push_str("// ");
                out.push_str(rest);
            }
            continue;
        };

        if verbose {
            out.push_str(line);
        }
        let fail = |message: String| Error::Macro { line: lineno, message };
        match directive {
            "if" => {
                let predicate = evaluate(argument, &labels).map_err(fail)? != 0;
                stack.push((active, predicate));
                active = active && predicate;
            }
            "else" => {
                let (outer, predicate) = *stack.last().ok_or_else(|| fail("`#else` without `#if`".into()))?;
                active = outer && !predicate;
            }
            "endif" => {
                let (outer, _) = stack.pop().ok_or_else(|| fail("`#endif` without `#if`".into()))?;
                active = outer;
            }
            "define" if active => {
                for label in argument.split(',').map(str::trim).filter(|l| !l.is_empty()) {
                    match label.strip_prefix('~') {
                        Some(removed) => {
                            labels.remove(removed.trim());
                        }
                        None => {
                            labels.insert(label.to_string());
                        }
                    }
                }
            }
            "print_features_state" if active => {
                let (indent, _) = split_indent(line);
                out.push_str(indent);
                let states: Vec<String> = features
                    .iter()
                    .map(|(name, _)| format!("{}:{}", name, labels.contains(name)))
                    .collect();
                out.push_str(&states.join(", "));
                out.push('\n');
            }
            "define" | "print_features_state" | "" => {}
            other => return Err(fail(format!("unknown directive `#{}`", other))),
        }
    }

    if !stack.is_empty() {
        return Err(Error::Macro { line: source.lines().count(), message: "unterminated `#if`".into() });
    }
    Ok(out)
}

/// Returns `(directive, argument)` for lines shaped `// #directive argument`.
fn parse_directive(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim_start().strip_prefix("//")?.trim_start().strip_prefix('#')?;
    let end = rest.find(|c: char| !(c.is_alphanumeric() || c == '_')).unwrap_or(rest.len());
    Some((&rest[..end], rest[end..].trim()))
}

fn split_indent(line: &str) -> (&str, &str) {
    let end = line.len() - line.trim_start().len();
    line.split_at(end)
}

// ============================================================================
//  EXPRESSIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(i64),
    Name(String),
    Not,
    And,
    Or,
    Open,
    Close,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Plus,
    Minus,
    Star,
}

fn tokenize(expr: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let (token, width) = match (c, next) {
            (c, _) if c.is_whitespace() => {
                i += 1;
                continue;
            }
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('&', _) => (Token::And, 1),
            ('|', _) => (Token::Or, 1),
            ('~', _) | ('!', _) => (Token::Not, 1),
            ('(', _) => (Token::Open, 1),
            (')', _) => (Token::Close, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            (c, _) if c.is_ascii_digit() => {
                let len = chars[i..].iter().take_while(|c| c.is_ascii_digit()).count();
                let text: String = chars[i..i + len].iter().collect();
                let n = text.parse().map_err(|e| format!("bad number `{}`: {}", text, e))?;
                (Token::Num(n), len)
            }
            (c, _) if c.is_alphabetic() || c == '_' => {
                let len = chars[i..].iter().take_while(|c| c.is_alphanumeric() || **c == '_').count();
                (Token::Name(chars[i..i + len].iter().collect()), len)
            }
            (c, _) => return Err(format!("unexpected character `{}`", c)),
        };
        tokens.push(token);
        i += width;
    }
    Ok(tokens)
}

/// Evaluates an `#if` expression. Feature names are `1` when in `labels`.
pub(crate) fn evaluate(expr: &str, labels: &BTreeSet<String>) -> std::result::Result<i64, String> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return Err("empty `#if` expression".into());
    }
    let mut parser = Parser { tokens, pos: 0, labels };
    let value = parser.or()?;
    match parser.tokens.get(parser.pos) {
        None => Ok(value),
        Some(t) => Err(format!("unexpected {:?}", t)),
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    labels: &'a BTreeSet<String>,
}

impl Parser<'_> {
    fn eat(&mut self, token: &Token) -> bool {
        if self.tokens.get(self.pos) == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> std::result::Result<i64, String> {
        let mut value = self.and()?;
        while self.eat(&Token::Or) {
            let rhs = self.and()?;
            value = i64::from(value != 0 || rhs != 0);
        }
        Ok(value)
    }

    fn and(&mut self) -> std::result::Result<i64, String> {
        let mut value = self.not()?;
        while self.eat(&Token::And) {
            let rhs = self.not()?;
            value = i64::from(value != 0 && rhs != 0);
        }
        Ok(value)
    }

    fn not(&mut self) -> std::result::Result<i64, String> {
        if self.eat(&Token::Not) {
            return Ok(i64::from(self.not()? == 0));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> std::result::Result<i64, String> {
        let lhs = self.sum()?;
        let op = match self.tokens.get(self.pos) {
            Some(t @ (Token::Eq | Token::Ne | Token::Lt | Token::Gt | Token::Le | Token::Ge)) => t.clone(),
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.sum()?;
        let holds = match op {
            Token::Eq => lhs == rhs,
            Token::Ne => lhs != rhs,
            Token::Lt => lhs < rhs,
            Token::Gt => lhs > rhs,
            Token::Le => lhs <= rhs,
            _ => lhs >= rhs,
        };
        Ok(i64::from(holds))
    }

    fn sum(&mut self) -> std::result::Result<i64, String> {
        let mut value = self.product()?;
        loop {
            if self.eat(&Token::Plus) {
                value = value.wrapping_add(self.product()?);
            } else if self.eat(&Token::Minus) {
                value = value.wrapping_sub(self.product()?);
            } else {
                return Ok(value);
            }
        }
    }

    fn product(&mut self) -> std::result::Result<i64, String> {
        let mut value = self.unary()?;
        while self.eat(&Token::Star) {
            value = value.wrapping_mul(self.unary()?);
        }
        Ok(value)
    }

    fn unary(&mut self) -> std::result::Result<i64, String> {
        if self.eat(&Token::Minus) {
            return Ok(self.unary()?.wrapping_neg());
        }
        self.atom()
    }

    fn atom(&mut self) -> std::result::Result<i64, String> {
        let token = self.tokens.get(self.pos).cloned().ok_or("expression ends too early")?;
        self.pos += 1;
        match token {
            Token::Num(n) => Ok(n),
            Token::Name(name) => Ok(i64::from(self.labels.contains(&name))),
            Token::Open => {
                let value = self.or()?;
                if self.eat(&Token::Close) { Ok(value) } else { Err("missing `)`".into()) }
            }
            other => Err(format!("unexpected {:?}", other)),
        }
    }
}
