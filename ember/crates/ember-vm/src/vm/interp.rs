//! Runtime string interpolation.
//!
//! `STRING_INTERPOLATE` carries the raw body of an interpolated literal.
//! At execution time the body is split into literal and `${expr}`
//! segments; each expression is compiled with a fresh compiler (the
//! scanner and compiler are values, so this nests freely under the
//! running dispatch loop) and evaluated in the current execution, with
//! globals visible. Results are concatenated in display form.

use ember_compile::compile_fragment;
use ember_lex::unescape;
use ember_util::Handler;

use crate::exception::ExceptionKind;
use crate::frame::Outcome;
use crate::value::Value;
use crate::vm::Vm;

/// One piece of an interpolated string body.
#[derive(Debug, PartialEq, Eq)]
enum Segment {
    /// Literal text (escapes still raw).
    Literal(String),
    /// The source text of a `${...}` expression.
    Expr(String),
}

impl Vm {
    /// Evaluates an interpolated-string body into a string value.
    pub(crate) fn interpolate(&mut self, raw: &str) -> Result<Value, Value> {
        let segments = split_segments(raw).map_err(|message| {
            self.make_error(ExceptionKind::Syntax, message)
        })?;

        let mut out = String::new();
        for segment in segments {
            match segment {
                Segment::Literal(text) => out.push_str(&unescape(&text)),
                Segment::Expr(source) => {
                    let value = self.eval_fragment(&source)?;
                    out.push_str(&self.heap.display_value(&value));
                }
            }
        }
        Ok(self.heap.string_value(&out))
    }

    /// Compiles and runs one `${expr}` fragment in the current
    /// execution.
    fn eval_fragment(&mut self, source: &str) -> Result<Value, Value> {
        let handler = Handler::new();
        let fragment = compile_fragment(source, &handler).map_err(|error| {
            self.make_error(
                ExceptionKind::Syntax,
                format!("invalid interpolation expression: {error}"),
            )
        })?;

        let floor = self.exec_ref().frames.len() + 1;
        self.pushv(Value::Function(fragment.clone()))?;
        self.call_function(fragment, 0, None)?;
        match self.execute(floor, None) {
            Outcome::Returned(value) => {
                // The return value was pushed by the return path; the
                // expression result is handed back by value.
                self.popv();
                Ok(value)
            }
            Outcome::Threw(exception) => Err(exception),
            _ => Err(self.make_error(
                ExceptionKind::Runtime,
                "interpolation expression suspended",
            )),
        }
    }
}

/// Splits a raw interpolated-string body into segments, honoring escape
/// sequences, nested braces, and string literals inside `${...}`.
fn split_segments(raw: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            literal.push(c);
            if let Some(escaped) = chars.next() {
                literal.push(escaped);
            }
            continue;
        }
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // '{'
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }

            let mut expr = String::new();
            let mut depth = 1usize;
            loop {
                let Some(c) = chars.next() else {
                    return Err("unterminated interpolation".to_string());
                };
                match c {
                    '{' => {
                        depth += 1;
                        expr.push(c);
                    }
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                        expr.push(c);
                    }
                    '"' => {
                        expr.push(c);
                        loop {
                            let Some(inner) = chars.next() else {
                                return Err("unterminated string in interpolation".to_string());
                            };
                            expr.push(inner);
                            if inner == '\\' {
                                if let Some(escaped) = chars.next() {
                                    expr.push(escaped);
                                }
                            } else if inner == '"' {
                                break;
                            }
                        }
                    }
                    other => expr.push(other),
                }
            }
            if expr.trim().is_empty() {
                return Err("empty interpolation expression".to_string());
            }
            segments.push(Segment::Expr(expr));
            continue;
        }
        literal.push(c);
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain_text() {
        let segments = split_segments("no interpolation").unwrap();
        assert_eq!(
            segments,
            vec![Segment::Literal("no interpolation".to_string())]
        );
    }

    #[test]
    fn test_split_mixed() {
        let segments = split_segments("a ${x + 1} b ${y} c").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Literal("a ".to_string()),
                Segment::Expr("x + 1".to_string()),
                Segment::Literal(" b ".to_string()),
                Segment::Expr("y".to_string()),
                Segment::Literal(" c".to_string()),
            ]
        );
    }

    #[test]
    fn test_split_nested_braces_and_strings() {
        let segments = split_segments("${m[\"}\"]} end").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Expr("m[\"}\"]".to_string()),
                Segment::Literal(" end".to_string()),
            ]
        );
    }

    #[test]
    fn test_split_escaped_dollar_is_literal() {
        let segments = split_segments("cost: \\${x}").unwrap();
        assert_eq!(
            segments,
            vec![Segment::Literal("cost: \\${x}".to_string())]
        );
    }

    #[test]
    fn test_split_errors() {
        assert!(split_segments("${unclosed").is_err());
        assert!(split_segments("${}").is_err());
    }
}
