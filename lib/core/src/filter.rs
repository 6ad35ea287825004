// Metadata filters, evaluated against records before ranking.
use serde_json::Value;

use crate::{Error, Record, Result};

pub trait Filter: Send + Sync {
    fn matches(&self, record: &Record) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterCondition {
    Equals { field: String, value: Value },
    NotEquals { field: String, value: Value },
    GreaterThan { field: String, value: f64 },
    LessThan { field: String, value: f64 },
    GreaterEqual { field: String, value: f64 },
    LessEqual { field: String, value: f64 },
    Contains { field: String, value: String },
    And(Vec<FilterCondition>),
    Or(Vec<FilterCondition>),
    Not(Box<FilterCondition>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayloadFilter {
    condition: FilterCondition,
}

impl PayloadFilter {
    pub fn new(condition: FilterCondition) -> Self {
        Self { condition }
    }

    /// Parse a boolean expression such as `item_id == "cat_1234" && created_at > 10`.
    pub fn parse(expr: &str) -> Result<Self> {
        Ok(Self::new(FilterCondition::parse(expr)?))
    }

    pub fn condition(&self) -> &FilterCondition {
        &self.condition
    }

    /// Dotted paths walk into nested objects; a leading dot is ignored.
    fn get_field_value<'a>(record: &'a Record, field: &str) -> Option<&'a Value> {
        let field = field.strip_prefix('.').unwrap_or(field);
        let mut parts = field.split('.');
        let mut current = record.field(parts.next()?)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn values_equal(a: &Value, b: &Value) -> bool {
        match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
            _ => a == b,
        }
    }

    fn numeric(record: &Record, field: &str) -> Option<f64> {
        Self::get_field_value(record, field).and_then(Value::as_f64)
    }

    fn matches_condition(condition: &FilterCondition, record: &Record) -> bool {
        match condition {
            FilterCondition::Equals { field, value } => Self::get_field_value(record, field)
                .map(|v| Self::values_equal(v, value))
                .unwrap_or(false),
            FilterCondition::NotEquals { field, value } => Self::get_field_value(record, field)
                .map(|v| !Self::values_equal(v, value))
                .unwrap_or(true),
            FilterCondition::GreaterThan { field, value } => Self::numeric(record, field)
                .map(|v| v > *value)
                .unwrap_or(false),
            FilterCondition::LessThan { field, value } => Self::numeric(record, field)
                .map(|v| v < *value)
                .unwrap_or(false),
            FilterCondition::GreaterEqual { field, value } => Self::numeric(record, field)
                .map(|v| v >= *value)
                .unwrap_or(false),
            FilterCondition::LessEqual { field, value } => Self::numeric(record, field)
                .map(|v| v <= *value)
                .unwrap_or(false),
            FilterCondition::Contains { field, value } => {
                match Self::get_field_value(record, field) {
                    Some(Value::String(s)) => s.contains(value.as_str()),
                    Some(Value::Array(items)) => items.iter().any(|i| i.as_str() == Some(value)),
                    _ => false,
                }
            }
            FilterCondition::And(conditions) => {
                conditions.iter().all(|c| Self::matches_condition(c, record))
            }
            FilterCondition::Or(conditions) => {
                conditions.iter().any(|c| Self::matches_condition(c, record))
            }
            FilterCondition::Not(condition) => !Self::matches_condition(condition, record),
        }
    }
}

impl Filter for PayloadFilter {
    fn matches(&self, record: &Record) -> bool {
        Self::matches_condition(&self.condition, record)
    }
}

impl FilterCondition {
    pub fn parse(expr: &str) -> Result<Self> {
        let tokens = tokenize(expr)?;
        if tokens.is_empty() {
            return Err(Error::InvalidFilter("empty expression".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0, depth: 0 };
        let condition = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(Error::InvalidFilter(format!("unexpected token {:?}", tok)));
        }
        Ok(condition)
    }

    /// Every metadata field this condition reads.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            FilterCondition::Equals { field, .. }
            | FilterCondition::NotEquals { field, .. }
            | FilterCondition::GreaterThan { field, .. }
            | FilterCondition::LessThan { field, .. }
            | FilterCondition::GreaterEqual { field, .. }
            | FilterCondition::LessEqual { field, .. }
            | FilterCondition::Contains { field, .. } => out.push(field),
            FilterCondition::And(cs) | FilterCondition::Or(cs) => {
                cs.iter().for_each(|c| c.collect_fields(out))
            }
            FilterCondition::Not(c) => c.collect_fields(out),
        }
    }
}

fn build_comparison(field: String, op: &str, value: Value) -> Result<FilterCondition> {
    let number = |value: &Value| {
        value
            .as_f64()
            .ok_or_else(|| Error::InvalidFilter(format!("operator '{}' needs a number", op)))
    };
    Ok(match op {
        "eq" | "==" => FilterCondition::Equals { field, value },
        "ne" | "!=" => FilterCondition::NotEquals { field, value },
        "gt" | ">" => FilterCondition::GreaterThan { value: number(&value)?, field },
        "lt" | "<" => FilterCondition::LessThan { value: number(&value)?, field },
        "gte" | ">=" => FilterCondition::GreaterEqual { value: number(&value)?, field },
        "lte" | "<=" => FilterCondition::LessEqual { value: number(&value)?, field },
        "contains" => match value {
            Value::String(s) => FilterCondition::Contains { field, value: s },
            _ => {
                return Err(Error::InvalidFilter(
                    "operator 'contains' needs a string".to_string(),
                ))
            }
        },
        other => return Err(Error::InvalidFilter(format!("unknown operator '{}'", other))),
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(Error::InvalidFilter("unterminated string".to_string())),
                        Some('\\') => {
                            if let Some(&next) = chars.get(i + 1) {
                                s.push(next);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
                let op = match two.as_str() {
                    "==" => Some("=="),
                    "!=" => Some("!="),
                    ">=" => Some(">="),
                    "<=" => Some("<="),
                    "&&" => Some("&&"),
                    "||" => Some("||"),
                    _ => None,
                };
                if let Some(op) = op {
                    tokens.push(Token::Op(op));
                    i += 2;
                } else {
                    let op = match c {
                        '<' => "<",
                        '>' => ">",
                        '!' => "!",
                        _ => {
                            return Err(Error::InvalidFilter(format!(
                                "unexpected character '{}' at {}",
                                c, i
                            )))
                        }
                    };
                    tokens.push(Token::Op(op));
                    i += 1;
                }
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | 'e' | 'E' | '+' | '-'))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| Error::InvalidFilter(format!("bad number '{}'", text)))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.')) {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(Error::InvalidFilter(format!(
                    "unexpected character '{}' at {}",
                    other, i
                )))
            }
        }
    }
    Ok(tokens)
}

/// Deepest nesting of `!` and parentheses a filter may use.
const MAX_DEPTH: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn is_keyword(&self, op: &str, word: &str) -> bool {
        match self.peek() {
            Some(Token::Op(o)) => *o == op,
            Some(Token::Ident(w)) => w.eq_ignore_ascii_case(word),
            _ => false,
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            other => Err(Error::InvalidFilter(format!(
                "expected {:?}, found {:?}",
                expected, other
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<FilterCondition> {
        let mut items = vec![self.parse_and()?];
        while self.is_keyword("||", "or") {
            self.pos += 1;
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 { items.remove(0) } else { FilterCondition::Or(items) })
    }

    fn parse_and(&mut self) -> Result<FilterCondition> {
        let mut items = vec![self.parse_unary()?];
        while self.is_keyword("&&", "and") {
            self.pos += 1;
            items.push(self.parse_unary()?);
        }
        Ok(if items.len() == 1 { items.remove(0) } else { FilterCondition::And(items) })
    }

    fn parse_unary(&mut self) -> Result<FilterCondition> {
        if self.is_keyword("!", "not") {
            self.pos += 1;
            self.enter()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(FilterCondition::Not(Box::new(inner)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            self.enter()?;
            let inner = self.parse_or()?;
            self.expect(Token::RParen)?;
            self.depth -= 1;
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(Error::InvalidFilter("filter nested too deeply".to_string()));
        }
        Ok(())
    }

    fn parse_field(&mut self) -> Result<String> {
        let name = match self.next() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(Error::InvalidFilter(format!(
                    "expected field name, found {:?}",
                    other
                )))
            }
        };
        // metadata["item_id"] addresses a field of the metadata document
        if self.peek() == Some(&Token::LBracket) {
            self.pos += 1;
            let inner = match self.next() {
                Some(Token::Str(s)) => s,
                other => {
                    return Err(Error::InvalidFilter(format!(
                        "expected quoted key, found {:?}",
                        other
                    )))
                }
            };
            self.expect(Token::RBracket)?;
            return Ok(if name == "metadata" { inner } else { format!("{}.{}", name, inner) });
        }
        Ok(name.strip_prefix("metadata.").map(str::to_string).unwrap_or(name))
    }

    fn parse_comparison(&mut self) -> Result<FilterCondition> {
        let field = self.parse_field()?;
        let op = match self.next() {
            Some(Token::Op(op)) => op.to_string(),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("contains") => "contains".to_string(),
            other => {
                return Err(Error::InvalidFilter(format!(
                    "expected comparison operator after '{}', found {:?}",
                    field, other
                )))
            }
        };
        let value = match self.next() {
            Some(Token::Str(s)) => Value::String(s),
            Some(Token::Num(n)) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => Value::from(n as i64),
            Some(Token::Num(n)) => serde_json::Number::from_f64(n)
                .map(Value::Number)
                .ok_or_else(|| Error::InvalidFilter(format!("non-finite number {}", n)))?,
            Some(Token::Ident(word)) => match word.to_ascii_lowercase().as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                "null" => Value::Null,
                _ => return Err(Error::InvalidFilter(format!("unexpected identifier '{}'", word))),
            },
            other => return Err(Error::InvalidFilter(format!("expected literal, found {:?}", other))),
        };
        build_comparison(field, &op, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{into_metadata, Vector};
    use serde_json::json;

    fn record(meta: Value) -> Record {
        Record::new("k", Vector::new(vec![1.0]).normalize(), into_metadata(meta))
    }

    #[test]
    fn test_parse_simple_equality() {
        let cond = FilterCondition::parse(r#"item_id == "cat_1234""#).unwrap();
        assert_eq!(
            cond,
            FilterCondition::Equals { field: "item_id".into(), value: json!("cat_1234") }
        );
    }

    #[test]
    fn test_parse_metadata_subscript() {
        let cond = FilterCondition::parse(r#"metadata["item_id"] != 'x'"#).unwrap();
        assert_eq!(cond.fields(), vec!["item_id"]);
    }

    #[test]
    fn test_parse_precedence() {
        let cond = FilterCondition::parse("a == 1 || b == 2 && not c > 3").unwrap();
        match cond {
            FilterCondition::Or(items) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(items[1], FilterCondition::And(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(FilterCondition::parse("").is_err());
        assert!(FilterCondition::parse("a ==").is_err());
        assert!(FilterCondition::parse("(a == 1").is_err());
        assert!(FilterCondition::parse("a > 'x'").is_err());
        assert!(FilterCondition::parse("a == 1 b").is_err());
    }

    #[test]
    fn test_matches() {
        let r = record(json!({"item_id": "cat_1234", "created_at": 100, "tags": ["red"], "shop": {"id": 7}}));
        let ok = |e: &str| PayloadFilter::parse(e).unwrap().matches(&r);
        assert!(ok(r#"item_id == "cat_1234""#));
        assert!(ok("created_at == 100.0"));
        assert!(ok("created_at >= 100 && created_at < 101"));
        assert!(ok(r#"item_id contains "cat""#));
        assert!(ok(r#"tags contains "red""#));
        assert!(ok("shop.id == 7"));
        assert!(ok("missing != 1"));
        assert!(!ok("missing == 1"));
        assert!(!ok(r#"!(item_id == "cat_1234")"#));
    }

    #[test]
    fn test_nesting_limit() {
        let bangs = format!("{}a == 1", "!".repeat(10_000));
        assert!(matches!(FilterCondition::parse(&bangs), Err(Error::InvalidFilter(_))));

        let parens = format!("{}a == 1{}", "(".repeat(10_000), ")".repeat(10_000));
        match FilterCondition::parse(&parens) {
            Err(Error::InvalidFilter(msg)) => assert!(msg.contains("nested too deeply")),
            other => panic!("unexpected {:?}", other),
        }

        let nots = format!("{}a == 1", "not ".repeat(MAX_DEPTH + 1));
        assert!(FilterCondition::parse(&nots).is_err());

        let shallow = format!("{}a == 1{}", "(".repeat(MAX_DEPTH), ")".repeat(MAX_DEPTH));
        let r = record(json!({"a": 1}));
        assert!(PayloadFilter::parse(&shallow).unwrap().matches(&r));
        assert!(PayloadFilter::parse("!!!!a == 1").unwrap().matches(&r));
    }
}
