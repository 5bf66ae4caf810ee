/// Integer arithmetic for `Set /a $var expr`.
///
/// Supports `+`, `-`, `*`, `/`, `%`, unary `-`, and parentheses with the
/// usual precedence. Division truncates toward zero.
///
/// ```text
/// Set /a $n ($n+1)*2
/// $n:=$n%7
/// ```
use std::iter::Peekable;
use std::str::Chars;

use crate::error::{ReciteError, Result};

/// Evaluate an already variable-expanded expression.
pub fn evaluate(expr: &str) -> Result<i64> {
    eval_expr(expr).map_err(|reason| ReciteError::Expression {
        expr: expr.to_string(),
        reason,
    })
}

// ---------------------------------------------------------------------------
// Recursive-descent evaluator
// ---------------------------------------------------------------------------

type EvalResult = std::result::Result<i64, String>;

fn eval_expr(s: &str) -> EvalResult {
    let mut chars = s.chars().peekable();
    let result = parse_add_sub(&mut chars)?;
    skip_ws(&mut chars);
    if let Some(c) = chars.peek() {
        return Err(format!("unexpected character '{}'", c));
    }
    Ok(result)
}

fn skip_ws(chars: &mut Peekable<Chars>) {
    while chars.peek().map_or(false, |c| c.is_whitespace()) {
        chars.next();
    }
}

fn overflow() -> String {
    "integer overflow".to_string()
}

fn parse_add_sub(chars: &mut Peekable<Chars>) -> EvalResult {
    let mut left = parse_mul_div(chars)?;
    loop {
        skip_ws(chars);
        match chars.peek() {
            Some('+') => {
                chars.next();
                let right = parse_mul_div(chars)?;
                left = left.checked_add(right).ok_or_else(overflow)?;
            }
            Some('-') => {
                chars.next();
                let right = parse_mul_div(chars)?;
                left = left.checked_sub(right).ok_or_else(overflow)?;
            }
            _ => break,
        }
    }
    Ok(left)
}

fn parse_mul_div(chars: &mut Peekable<Chars>) -> EvalResult {
    let mut left = parse_unary(chars)?;
    loop {
        skip_ws(chars);
        match chars.peek() {
            Some('*') => {
                chars.next();
                let right = parse_unary(chars)?;
                left = left.checked_mul(right).ok_or_else(overflow)?;
            }
            Some('/') => {
                chars.next();
                let right = parse_unary(chars)?;
                if right == 0 {
                    return Err("division by zero".to_string());
                }
                left = left.checked_div(right).ok_or_else(overflow)?;
            }
            Some('%') => {
                chars.next();
                let right = parse_unary(chars)?;
                if right == 0 {
                    return Err("modulo by zero".to_string());
                }
                left = left.checked_rem(right).ok_or_else(overflow)?;
            }
            _ => break,
        }
    }
    Ok(left)
}

fn parse_unary(chars: &mut Peekable<Chars>) -> EvalResult {
    skip_ws(chars);
    if chars.peek() == Some(&'-') {
        chars.next();
        return parse_unary(chars)?.checked_neg().ok_or_else(overflow);
    }
    if chars.peek() == Some(&'+') {
        chars.next();
    }
    parse_primary(chars)
}

fn parse_primary(chars: &mut Peekable<Chars>) -> EvalResult {
    skip_ws(chars);
    if chars.peek() == Some(&'(') {
        chars.next();
        let val = parse_add_sub(chars)?;
        skip_ws(chars);
        return match chars.next() {
            Some(')') => Ok(val),
            other => Err(format!("expected ')', got {:?}", other)),
        };
    }

    let mut num = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            num.push(c);
            chars.next();
        } else {
            break;
        }
    }

    if num.is_empty() {
        return match chars.peek() {
            Some(c) => Err(format!("unexpected character '{}'", c)),
            None => Err("unexpected end of expression".to_string()),
        };
    }

    num.parse::<i64>()
        .map_err(|e| format!("invalid number '{}': {}", num, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_and_parentheses() {
        assert_eq!(evaluate("3+3").unwrap(), 6);
        assert_eq!(evaluate("2+3*4").unwrap(), 14);
        assert_eq!(evaluate("(10-2)*3").unwrap(), 24);
        assert_eq!(evaluate(" 17 % 5 ").unwrap(), 2);
        assert_eq!(evaluate("-(4+1)").unwrap(), -5);
        assert_eq!(evaluate("7/2").unwrap(), 3);
    }

    #[test]
    fn errors_are_reported() {
        assert!(matches!(
            evaluate("1/0"),
            Err(ReciteError::Expression { .. })
        ));
        assert!(evaluate("2+").is_err());
        assert!(evaluate("(1+2").is_err());
        assert!(evaluate("abc").is_err());
        assert!(evaluate("").is_err());
    }
}
