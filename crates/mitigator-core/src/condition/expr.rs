//! Check-Expression Dialect
//!
//! Stored conditions carry their predicate as a string in a small Lisp-ish
//! dialect, e.g.
//!
//! ```text
//! (and (endswith (get parameters "file_path") ".py")
//!      (contains (get parameters "file_permissions") "x"))
//! ```
//!
//! The dialect is closed: expressions are parsed once at load time against
//! the builtin table below and anything outside it is rejected with a
//! syntax error. Evaluation is pure except for `query-rows`, which queries
//! the situational-awareness graph database and yields the row count.
//!
//! Builtins:
//!
//! | form | meaning |
//! |---|---|
//! | `(get parameters "k")` | merged parameter lookup, `none` if absent |
//! | `(== a b)` `(!= a b)` `(< a b)` `(<= a b)` `(> a b)` `(>= a b)` | comparisons |
//! | `(and e…)` `(or e…)` `(not e)` | short-circuit boolean logic |
//! | `(in needle haystack)` | list membership or substring |
//! | `(is-none e)` `(is-not-none e)` | null checks |
//! | `(startswith s p)` `(endswith s p)` `(contains s p)` | string predicates |
//! | `(in-cidr ip "10.0.0.0/8")` | CIDR containment |
//! | `(query-rows "…")` | graph-database row count |

use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use ipnet::IpNet;

use crate::graphdb::GraphQuery;
use crate::{FieldValue, MitigatorError, Result};

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// String predicate builtins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrFn {
    StartsWith,
    EndsWith,
    Contains,
}

/// Parsed check expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lit(FieldValue),
    /// `(get parameters "key")`
    Param(String),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    In(Box<Expr>, Box<Expr>),
    IsNone { inner: Box<Expr>, negated: bool },
    StrFn(StrFn, Box<Expr>, Box<Expr>),
    InCidr(Box<Expr>, Box<Expr>),
    QueryRows(String),
}

/// Evaluation context: the merged parameter map plus the graph-database
/// collaborator for `query-rows`.
pub struct EvalContext<'a> {
    pub parameters: &'a BTreeMap<String, FieldValue>,
    pub graph: &'a dyn GraphQuery,
}

type EvalFuture<'a> = Pin<Box<dyn Future<Output = Result<FieldValue>> + Send + 'a>>;

impl Expr {
    /// Parse an expression from its stored source text.
    pub fn parse(src: &str) -> Result<Expr> {
        let tokens = tokenize(src)?;
        let mut pos = 0;
        let expr = parse_expr(&tokens, &mut pos)?;
        if pos != tokens.len() {
            return Err(syntax("trailing tokens after expression"));
        }
        Ok(expr)
    }

    /// Evaluate to a value.
    pub fn eval<'a>(&'a self, ctx: &'a EvalContext<'a>) -> EvalFuture<'a> {
        Box::pin(async move {
            match self {
                Expr::Lit(v) => Ok(v.clone()),
                Expr::Param(key) => Ok(ctx
                    .parameters
                    .get(key)
                    .cloned()
                    .unwrap_or(FieldValue::Null)),
                Expr::Cmp(op, lhs, rhs) => {
                    let a = lhs.eval(ctx).await?;
                    let b = rhs.eval(ctx).await?;
                    compare(*op, &a, &b).map(FieldValue::Bool)
                }
                Expr::And(operands) => {
                    for operand in operands {
                        if !operand.eval_bool(ctx).await? {
                            return Ok(FieldValue::Bool(false));
                        }
                    }
                    Ok(FieldValue::Bool(true))
                }
                Expr::Or(operands) => {
                    for operand in operands {
                        if operand.eval_bool(ctx).await? {
                            return Ok(FieldValue::Bool(true));
                        }
                    }
                    Ok(FieldValue::Bool(false))
                }
                Expr::Not(inner) => Ok(FieldValue::Bool(!inner.eval_bool(ctx).await?)),
                Expr::In(needle, haystack) => {
                    let needle = needle.eval(ctx).await?;
                    let haystack = haystack.eval(ctx).await?;
                    membership(&needle, &haystack).map(FieldValue::Bool)
                }
                Expr::IsNone { inner, negated } => {
                    let value = inner.eval(ctx).await?;
                    Ok(FieldValue::Bool(value.is_null() != *negated))
                }
                Expr::StrFn(f, subject, operand) => {
                    let subject = string_arg(subject.eval(ctx).await?, "string predicate")?;
                    let operand = string_arg(operand.eval(ctx).await?, "string predicate")?;
                    let result = match f {
                        StrFn::StartsWith => subject.starts_with(&operand),
                        StrFn::EndsWith => subject.ends_with(&operand),
                        StrFn::Contains => subject.contains(&operand),
                    };
                    Ok(FieldValue::Bool(result))
                }
                Expr::InCidr(ip, cidr) => {
                    let ip = string_arg(ip.eval(ctx).await?, "in-cidr")?;
                    let cidr = string_arg(cidr.eval(ctx).await?, "in-cidr")?;
                    let ip: IpAddr = ip
                        .parse()
                        .map_err(|_| eval(format!("invalid IP address '{ip}'")))?;
                    let net: IpNet = cidr
                        .parse()
                        .map_err(|_| eval(format!("invalid CIDR '{cidr}'")))?;
                    Ok(FieldValue::Bool(net.contains(&ip)))
                }
                Expr::QueryRows(query) => {
                    let count = ctx.graph.row_count(query, ctx.parameters).await?;
                    Ok(FieldValue::Num(count as f64))
                }
            }
        })
    }

    /// Evaluate and require a boolean result.
    pub async fn eval_bool(&self, ctx: &EvalContext<'_>) -> Result<bool> {
        match self.eval(ctx).await? {
            FieldValue::Bool(b) => Ok(b),
            other => Err(eval(format!(
                "expected boolean, expression produced {}",
                other.type_name()
            ))),
        }
    }
}

fn compare(op: CmpOp, a: &FieldValue, b: &FieldValue) -> Result<bool> {
    use std::cmp::Ordering;
    match op {
        CmpOp::Eq => return Ok(a == b),
        CmpOp::Ne => return Ok(a != b),
        _ => {}
    }
    let ord = match (a, b) {
        (FieldValue::Num(x), FieldValue::Num(y)) => x.total_cmp(y),
        (FieldValue::Str(x), FieldValue::Str(y)) => x.cmp(y),
        _ => {
            return Err(eval(format!(
                "cannot order {} against {}",
                a.type_name(),
                b.type_name()
            )))
        }
    };
    Ok(match op {
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        _ => ord != Ordering::Less,
    })
}

fn membership(needle: &FieldValue, haystack: &FieldValue) -> Result<bool> {
    match (needle, haystack) {
        (_, FieldValue::List(items)) => Ok(items.contains(needle)),
        (FieldValue::Str(n), FieldValue::Str(h)) => Ok(h.contains(n.as_str())),
        _ => Err(eval(format!(
            "'in' expects a list or string haystack, got {}",
            haystack.type_name()
        ))),
    }
}

fn string_arg(value: FieldValue, what: &str) -> Result<String> {
    match value {
        FieldValue::Str(s) => Ok(s),
        other => Err(eval(format!(
            "{what} expects a string, got {}",
            other.type_name()
        ))),
    }
}

fn syntax(msg: impl Into<String>) -> MitigatorError {
    MitigatorError::ConditionSyntax(msg.into())
}

fn eval(msg: impl Into<String>) -> MitigatorError {
    MitigatorError::ConditionEval(msg.into())
}

// ---------------------------------------------------------------------------
// Tokenizer / parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    Str(String),
    Num(f64),
    Sym(String),
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('"') => s.push('"'),
                            Some('\\') => s.push('\\'),
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            other => {
                                return Err(syntax(format!(
                                    "invalid string escape {other:?}"
                                )))
                            }
                        },
                        Some(other) => s.push(other),
                        None => return Err(syntax("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' || c == '"' {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                let numeric = word.starts_with(|c: char| c.is_ascii_digit())
                    || (word.len() > 1 && word.starts_with('-'));
                match word.parse::<f64>() {
                    Ok(n) if numeric => tokens.push(Token::Num(n)),
                    _ => tokens.push(Token::Sym(word)),
                }
            }
        }
    }
    if tokens.is_empty() {
        return Err(syntax("empty expression"));
    }
    Ok(tokens)
}

fn parse_expr(tokens: &[Token], pos: &mut usize) -> Result<Expr> {
    let Some(token) = tokens.get(*pos) else {
        return Err(syntax("unexpected end of expression"));
    };
    *pos += 1;
    match token {
        Token::Num(n) => Ok(Expr::Lit(FieldValue::Num(*n))),
        Token::Str(s) => Ok(Expr::Lit(FieldValue::Str(s.clone()))),
        Token::Sym(s) => match s.as_str() {
            "true" => Ok(Expr::Lit(FieldValue::Bool(true))),
            "false" => Ok(Expr::Lit(FieldValue::Bool(false))),
            "none" => Ok(Expr::Lit(FieldValue::Null)),
            other => Err(syntax(format!("unknown symbol '{other}'"))),
        },
        Token::Close => Err(syntax("unexpected ')'")),
        Token::Open => {
            let head = match tokens.get(*pos) {
                Some(Token::Sym(s)) => s.clone(),
                _ => return Err(syntax("expected operator after '('")),
            };
            *pos += 1;
            let expr = parse_form(&head, tokens, pos)?;
            match tokens.get(*pos) {
                Some(Token::Close) => {
                    *pos += 1;
                    Ok(expr)
                }
                _ => Err(syntax(format!("missing ')' after '{head}' form"))),
            }
        }
    }
}

fn parse_form(head: &str, tokens: &[Token], pos: &mut usize) -> Result<Expr> {
    match head {
        "get" => {
            match tokens.get(*pos) {
                Some(Token::Sym(s)) if s == "parameters" => *pos += 1,
                _ => return Err(syntax("'get' must target the 'parameters' map")),
            }
            match tokens.get(*pos) {
                Some(Token::Str(key)) => {
                    *pos += 1;
                    Ok(Expr::Param(key.clone()))
                }
                _ => Err(syntax("'get' expects a string key")),
            }
        }
        "==" | "!=" | "<" | "<=" | ">" | ">=" => {
            let op = match head {
                "==" => CmpOp::Eq,
                "!=" => CmpOp::Ne,
                "<" => CmpOp::Lt,
                "<=" => CmpOp::Le,
                ">" => CmpOp::Gt,
                _ => CmpOp::Ge,
            };
            let lhs = parse_expr(tokens, pos)?;
            let rhs = parse_expr(tokens, pos)?;
            Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)))
        }
        "and" | "or" => {
            let mut operands = Vec::new();
            while !matches!(tokens.get(*pos), Some(Token::Close) | None) {
                operands.push(parse_expr(tokens, pos)?);
            }
            if operands.is_empty() {
                return Err(syntax(format!("'{head}' needs at least one operand")));
            }
            Ok(if head == "and" {
                Expr::And(operands)
            } else {
                Expr::Or(operands)
            })
        }
        "not" => Ok(Expr::Not(Box::new(parse_expr(tokens, pos)?))),
        "in" => {
            let needle = parse_expr(tokens, pos)?;
            let haystack = parse_expr(tokens, pos)?;
            Ok(Expr::In(Box::new(needle), Box::new(haystack)))
        }
        "is-none" | "is-not-none" => Ok(Expr::IsNone {
            inner: Box::new(parse_expr(tokens, pos)?),
            negated: head == "is-not-none",
        }),
        "startswith" | "endswith" | "contains" => {
            let f = match head {
                "startswith" => StrFn::StartsWith,
                "endswith" => StrFn::EndsWith,
                _ => StrFn::Contains,
            };
            let subject = parse_expr(tokens, pos)?;
            let operand = parse_expr(tokens, pos)?;
            Ok(Expr::StrFn(f, Box::new(subject), Box::new(operand)))
        }
        "in-cidr" => {
            let ip = parse_expr(tokens, pos)?;
            let cidr = parse_expr(tokens, pos)?;
            // A literal CIDR can be vetted now instead of on every alert.
            if let Expr::Lit(FieldValue::Str(s)) = &cidr {
                s.parse::<IpNet>()
                    .map_err(|_| syntax(format!("invalid CIDR literal '{s}'")))?;
            }
            Ok(Expr::InCidr(Box::new(ip), Box::new(cidr)))
        }
        "query-rows" => match tokens.get(*pos) {
            Some(Token::Str(query)) => {
                *pos += 1;
                Ok(Expr::QueryRows(query.clone()))
            }
            _ => Err(syntax("'query-rows' expects a string query")),
        },
        other => Err(syntax(format!("unknown form '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphdb::NoGraphDb;

    fn params(entries: &[(&str, FieldValue)]) -> BTreeMap<String, FieldValue> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn run(src: &str, parameters: &[(&str, FieldValue)]) -> Result<bool> {
        let expr = Expr::parse(src)?;
        let parameters = params(parameters);
        let ctx = EvalContext {
            parameters: &parameters,
            graph: &NoGraphDb,
        };
        expr.eval_bool(&ctx).await
    }

    #[tokio::test]
    async fn test_comparisons() {
        let p = [("port", FieldValue::Num(22.0))];
        assert!(run("(== (get parameters \"port\") 22)", &p).await.unwrap());
        assert!(run("(< (get parameters \"port\") 443)", &p).await.unwrap());
        assert!(!run("(!= (get parameters \"port\") 22)", &p).await.unwrap());
        assert!(run("(>= (get parameters \"port\") 22)", &p).await.unwrap());
    }

    #[tokio::test]
    async fn test_boolean_logic_short_circuits() {
        let p = [("x", FieldValue::Num(1.0))];
        // The second operand would error (ordering a string against a
        // number) but must never be evaluated.
        assert!(
            !run("(and false (< (get parameters \"x\") \"oops\"))", &p)
                .await
                .unwrap()
        );
        assert!(run("(or true (< (get parameters \"x\") \"oops\"))", &p)
            .await
            .unwrap());
        assert!(run("(not false)", &p).await.unwrap());
    }

    #[tokio::test]
    async fn test_string_predicates() {
        let p = [(
            "file_path",
            FieldValue::Str("/tmp/zerologon_tester.py".into()),
        )];
        assert!(run("(endswith (get parameters \"file_path\") \".py\")", &p)
            .await
            .unwrap());
        assert!(
            run("(startswith (get parameters \"file_path\") \"/tmp/\")", &p)
                .await
                .unwrap()
        );
        assert!(
            run("(contains (get parameters \"file_path\") \"zerologon\")", &p)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_membership() {
        let p = [(
            "mitre",
            FieldValue::List(vec![
                FieldValue::Str("T1041".into()),
                FieldValue::Str("T1219".into()),
            ]),
        )];
        assert!(run("(in \"T1041\" (get parameters \"mitre\"))", &p)
            .await
            .unwrap());
        assert!(!run("(in \"T9999\" (get parameters \"mitre\"))", &p)
            .await
            .unwrap());
        // Substring form
        assert!(run("(in \"xr-x\" \"rwxr-xr-x\")", &[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_null_checks() {
        let p = [("present", FieldValue::Str("x".into()))];
        assert!(run("(is-not-none (get parameters \"present\"))", &p)
            .await
            .unwrap());
        assert!(run("(is-none (get parameters \"absent\"))", &p)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cidr_containment() {
        let p = [("ip", FieldValue::Str("192.168.200.200".into()))];
        assert!(
            run("(in-cidr (get parameters \"ip\") \"192.168.0.0/16\")", &p)
                .await
                .unwrap()
        );
        assert!(!run("(in-cidr (get parameters \"ip\") \"10.0.0.0/8\")", &p)
            .await
            .unwrap());
    }

    #[test]
    fn test_unknown_form_rejected_at_parse() {
        assert!(matches!(
            Expr::parse("(shell \"rm -rf /\")"),
            Err(MitigatorError::ConditionSyntax(_))
        ));
        assert!(matches!(
            Expr::parse("(get alert \"x\")"),
            Err(MitigatorError::ConditionSyntax(_))
        ));
        assert!(matches!(
            Expr::parse("(== 1"),
            Err(MitigatorError::ConditionSyntax(_))
        ));
        assert!(matches!(
            Expr::parse("(in-cidr (get parameters \"ip\") \"not-a-cidr\")"),
            Err(MitigatorError::ConditionSyntax(_))
        ));
    }

    #[tokio::test]
    async fn test_query_rows_error_surfaces_as_eval_error() {
        // NoGraphDb always fails; the escape must produce an eval-time
        // error, not a panic or a silent success.
        let err = run("(> (query-rows \"MATCH (n) RETURN n\") 0)", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, MitigatorError::GraphDb(_)));
    }

    #[tokio::test]
    async fn test_non_boolean_top_level_is_eval_error() {
        let err = run("(query-rows \"MATCH (n) RETURN n\")", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, MitigatorError::GraphDb(_)));
        let err = run("42", &[]).await.unwrap_err();
        assert!(matches!(err, MitigatorError::ConditionEval(_)));
    }
}
