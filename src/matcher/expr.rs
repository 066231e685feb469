//! Expression language of `code` config values
//!
//! A program is a list of clauses separated by `;`. Each `when <cond> => <value>`
//! clause yields its value if the condition holds; a bare value is the default
//! and must come last. When nothing matches the config key is left out.
//!
//! ```text
//! program    := clause ( ";" clause )* [ ";" ]
//! clause     := "when" cond "=>" literal | literal
//! cond       := and ( "or" and )*
//! and        := unary ( "and" unary )*
//! unary      := "not" unary | "(" cond ")" | "true" | "false" | test
//! test       := attr cmp literal
//!             | attr "in" "[" literal ( "," literal )* "]"
//!             | "rollout" "(" integer ")"
//! attr       := os_type | os_version | app_version | ip | lang | device_id
//! cmp        := "==" | "!=" | ">" | ">=" | "<" | "<="
//! literal    := 'str' | "str" | integer | float | true | false
//! ```
//!
//! Versions may be written unquoted (`app_version >= 2.0.0`). Literal operands
//! are checked when the program is compiled; only client attributes can fail
//! at evaluation time. Conditions may nest `(` and `not` at most
//! [`MAX_NESTING`] deep.

use crate::common::rollout_bucket;
use crate::matcher::net::{parse_client_ip, IpRange};
use crate::matcher::version::Version;
use crate::matcher::ClientRequest;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    #[error("compile error at {pos}: {msg}")]
    Compile { pos: usize, msg: String },

    #[error("client {attr} {value:?} unusable: {reason}")]
    ClientAttr {
        attr: Attr,
        value: String,
        reason: String,
    },
}

/// Client attribute a test reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attr {
    OsType,
    OsVersion,
    AppVersion,
    Ip,
    Lang,
    DeviceId,
}

impl Attr {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "os_type" => Some(Attr::OsType),
            "os_version" => Some(Attr::OsVersion),
            "app_version" => Some(Attr::AppVersion),
            "ip" => Some(Attr::Ip),
            "lang" => Some(Attr::Lang),
            "device_id" => Some(Attr::DeviceId),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Attr::OsType => "os_type",
            Attr::OsVersion => "os_version",
            Attr::AppVersion => "app_version",
            Attr::Ip => "ip",
            Attr::Lang => "lang",
            Attr::DeviceId => "device_id",
        }
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    fn is_equality(&self) -> bool {
        matches!(self, CmpOp::Eq | CmpOp::Ne)
    }

    fn test(&self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
        }
    }
}

/// Compiled right-hand side of a test
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Lowercased for `os_type` and `lang`, verbatim for `device_id`
    Text(String),
    Version(Version),
    Ip(IpRange),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cond {
    Const(bool),
    Not(Box<Cond>),
    /// Two or more operands, all must hold
    All(Vec<Cond>),
    /// Two or more operands, one must hold
    Any(Vec<Cond>),
    Compare {
        attr: Attr,
        op: CmpOp,
        operand: Operand,
    },
    In {
        attr: Attr,
        set: Vec<Operand>,
    },
    /// Percentage of devices, 0..=100
    Rollout(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    /// `None` for the default clause
    pub cond: Option<Cond>,
    pub value: Value,
}

/// Inputs of one evaluation
pub struct EvalContext<'a> {
    pub client: &'a ClientRequest,
    /// Key of the config being evaluated, salts rollout buckets
    pub config_key: &'a str,
}

/// A compiled `code` value
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    source: String,
    clauses: Vec<Clause>,
}

impl Program {
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
            end: source.chars().count(),
        };
        let clauses = parser.program()?;
        Ok(Self {
            source: source.to_string(),
            clauses,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Value of the first matching clause, `None` when no clause matches
    pub fn eval(&self, ctx: &EvalContext<'_>) -> Result<Option<Value>, ExprError> {
        for clause in &self.clauses {
            let matched = match &clause.cond {
                Some(cond) => cond.eval(ctx)?,
                None => true,
            };
            if matched {
                return Ok(Some(clause.value.clone()));
            }
        }
        Ok(None)
    }
}

impl Cond {
    pub fn eval(&self, ctx: &EvalContext<'_>) -> Result<bool, ExprError> {
        match self {
            Cond::Const(b) => Ok(*b),
            Cond::Not(inner) => Ok(!inner.eval(ctx)?),
            Cond::All(conds) => {
                for cond in conds {
                    if !cond.eval(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Cond::Any(conds) => {
                for cond in conds {
                    if cond.eval(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Cond::Compare { attr, op, operand } => compare(ctx.client, *attr, *op, operand),
            Cond::In { attr, set } => {
                for operand in set {
                    if compare(ctx.client, *attr, CmpOp::Eq, operand)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Cond::Rollout(percent) => Ok(match ctx.client.device_id.as_deref() {
                Some(device) if !device.is_empty() => {
                    rollout_bucket(device, ctx.config_key) < u64::from(*percent)
                }
                _ => false,
            }),
        }
    }
}

fn compare(client: &ClientRequest, attr: Attr, op: CmpOp, operand: &Operand) -> Result<bool, ExprError> {
    let actual = client.attr(attr);
    let unusable = |reason: &str| ExprError::ClientAttr {
        attr,
        value: actual.unwrap_or_default().to_string(),
        reason: reason.to_string(),
    };

    match operand {
        Operand::Text(expected) => {
            let equal = match actual {
                Some(a) if matches!(attr, Attr::OsType | Attr::Lang) => a.eq_ignore_ascii_case(expected),
                Some(a) => a == expected,
                None => false,
            };
            Ok(op.test(if equal { Ordering::Equal } else { Ordering::Less }))
        }
        Operand::Version(expected) => {
            let raw = actual.ok_or_else(|| unusable("missing"))?;
            let version: Version = raw.parse().map_err(|_| unusable("not a version"))?;
            Ok(op.test(version.cmp(expected)))
        }
        Operand::Ip(range) => {
            let raw = actual.ok_or_else(|| unusable("missing"))?;
            let ip = parse_client_ip(raw).ok_or_else(|| unusable("not an ip address"))?;
            let inside = range.contains(ip);
            Ok(op.test(if inside { Ordering::Equal } else { Ordering::Less }))
        }
    }
}

// === Lexer ===

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    /// Digits with any number of dots, kept as written
    Num(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Arrow,
    Cmp(CmpOp),
}

fn compile_err(pos: usize, msg: impl Into<String>) -> ExprError {
    ExprError::Compile {
        pos,
        msg: msg.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Tok)>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let start = i;
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        let tok = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            '[' => Tok::LBracket,
            ']' => Tok::RBracket,
            ',' => Tok::Comma,
            ';' => Tok::Semi,
            '=' if next == Some('=') => Tok::Cmp(CmpOp::Eq),
            '=' if next == Some('>') => Tok::Arrow,
            '!' if next == Some('=') => Tok::Cmp(CmpOp::Ne),
            '>' if next == Some('=') => Tok::Cmp(CmpOp::Ge),
            '<' if next == Some('=') => Tok::Cmp(CmpOp::Le),
            '>' => Tok::Cmp(CmpOp::Gt),
            '<' => Tok::Cmp(CmpOp::Lt),
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(compile_err(start, "unterminated string")),
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| compile_err(start, "unterminated string"))?;
                            text.push(*escaped);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((start, Tok::Str(text)));
                continue;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
                    j += 1;
                }
                tokens.push((start, Tok::Num(chars[i..j].iter().collect())));
                i = j;
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                tokens.push((start, Tok::Ident(chars[i..j].iter().collect())));
                i = j;
                continue;
            }
            other => return Err(compile_err(start, format!("unexpected character {:?}", other))),
        };

        i += match tok {
            Tok::Cmp(CmpOp::Gt) | Tok::Cmp(CmpOp::Lt) => 1,
            Tok::Cmp(_) | Tok::Arrow => 2,
            _ => 1,
        };
        tokens.push((start, tok));
    }

    Ok(tokens)
}

// === Parser ===

/// Deepest nesting of `(` and `not` a condition may use
pub const MAX_NESTING: usize = 64;

struct Parser {
    tokens: Vec<(usize, Tok)>,
    pos: usize,
    /// Open `(` and `not` around the current token
    depth: usize,
    /// Character length of the source, position reported at end of input
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn here(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(p, _)| *p)
            .unwrap_or(self.end)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(s)) if s == keyword)
    }

    fn expect(&mut self, expected: Tok, what: &str) -> Result<(), ExprError> {
        let pos = self.here();
        match self.bump() {
            Some(tok) if tok == expected => Ok(()),
            _ => Err(compile_err(pos, format!("expected {}", what))),
        }
    }

    fn program(&mut self) -> Result<Vec<Clause>, ExprError> {
        let mut clauses: Vec<Clause> = Vec::new();
        while self.peek().is_some() {
            if clauses.last().is_some_and(|c| c.cond.is_none()) {
                return Err(compile_err(
                    self.here(),
                    "default value must be the last clause",
                ));
            }
            clauses.push(self.clause()?);

            let pos = self.here();
            match self.bump() {
                None | Some(Tok::Semi) => {}
                Some(_) => return Err(compile_err(pos, "expected ';'")),
            }
        }
        if clauses.is_empty() {
            return Err(compile_err(0, "empty program"));
        }
        Ok(clauses)
    }

    fn clause(&mut self) -> Result<Clause, ExprError> {
        if self.at_keyword("when") {
            self.bump();
            let cond = self.or()?;
            self.expect(Tok::Arrow, "'=>'")?;
            let value = self.value()?;
            Ok(Clause {
                cond: Some(cond),
                value,
            })
        } else {
            Ok(Clause {
                cond: None,
                value: self.value()?,
            })
        }
    }

    /// Literal produced by a clause
    fn value(&mut self) -> Result<Value, ExprError> {
        let pos = self.here();
        match self.bump() {
            Some(Tok::Str(s)) => Ok(Value::String(s)),
            Some(Tok::Ident(s)) if s == "true" => Ok(Value::Bool(true)),
            Some(Tok::Ident(s)) if s == "false" => Ok(Value::Bool(false)),
            Some(Tok::Num(text)) => match text.matches('.').count() {
                0 => text
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| compile_err(pos, "integer out of range")),
                1 => text
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| compile_err(pos, "invalid number")),
                _ => Err(compile_err(pos, "versions must be quoted when used as values")),
            },
            _ => Err(compile_err(pos, "expected a value")),
        }
    }

    fn or(&mut self) -> Result<Cond, ExprError> {
        let mut conds = vec![self.and()?];
        while self.at_keyword("or") {
            self.bump();
            conds.push(self.and()?);
        }
        Ok(if conds.len() == 1 {
            conds.remove(0)
        } else {
            Cond::Any(conds)
        })
    }

    fn and(&mut self) -> Result<Cond, ExprError> {
        let mut conds = vec![self.unary()?];
        while self.at_keyword("and") {
            self.bump();
            conds.push(self.unary()?);
        }
        Ok(if conds.len() == 1 {
            conds.remove(0)
        } else {
            Cond::All(conds)
        })
    }

    /// Parse a nested condition, refusing to go deeper than `MAX_NESTING`
    fn nested<T>(
        &mut self,
        pos: usize,
        inner: impl FnOnce(&mut Self) -> Result<T, ExprError>,
    ) -> Result<T, ExprError> {
        if self.depth >= MAX_NESTING {
            return Err(compile_err(
                pos,
                format!("conditions nested deeper than {}", MAX_NESTING),
            ));
        }
        self.depth += 1;
        let result = inner(self);
        self.depth -= 1;
        result
    }

    fn unary(&mut self) -> Result<Cond, ExprError> {
        let pos = self.here();
        match self.bump() {
            Some(Tok::Ident(word)) => match word.as_str() {
                "not" => self.nested(pos, |p| Ok(Cond::Not(Box::new(p.unary()?)))),
                "true" => Ok(Cond::Const(true)),
                "false" => Ok(Cond::Const(false)),
                "rollout" => self.rollout(),
                name => match Attr::from_name(name) {
                    Some(attr) => self.test(attr),
                    None => Err(compile_err(pos, format!("unknown attribute {:?}", name))),
                },
            },
            Some(Tok::LParen) => self.nested(pos, |p| {
                let cond = p.or()?;
                p.expect(Tok::RParen, "')'")?;
                Ok(cond)
            }),
            _ => Err(compile_err(pos, "expected a condition")),
        }
    }

    fn rollout(&mut self) -> Result<Cond, ExprError> {
        self.expect(Tok::LParen, "'(' after rollout")?;
        let pos = self.here();
        let percent = match self.bump() {
            Some(Tok::Num(text)) => text.parse::<u8>().ok().filter(|p| *p <= 100),
            _ => None,
        }
        .ok_or_else(|| compile_err(pos, "rollout takes an integer percentage 0..=100"))?;
        self.expect(Tok::RParen, "')'")?;
        Ok(Cond::Rollout(percent))
    }

    fn test(&mut self, attr: Attr) -> Result<Cond, ExprError> {
        let pos = self.here();
        match self.bump() {
            Some(Tok::Cmp(op)) => {
                let operand = self.operand(attr, op)?;
                Ok(Cond::Compare { attr, op, operand })
            }
            Some(Tok::Ident(word)) if word == "in" => {
                self.expect(Tok::LBracket, "'['")?;
                let mut set = vec![self.operand(attr, CmpOp::Eq)?];
                while self.peek() == Some(&Tok::Comma) {
                    self.bump();
                    set.push(self.operand(attr, CmpOp::Eq)?);
                }
                self.expect(Tok::RBracket, "']'")?;
                Ok(Cond::In { attr, set })
            }
            _ => Err(compile_err(pos, "expected a comparison operator or 'in'")),
        }
    }

    fn operand(&mut self, attr: Attr, op: CmpOp) -> Result<Operand, ExprError> {
        let pos = self.here();
        let text = match self.bump() {
            Some(Tok::Str(s)) | Some(Tok::Num(s)) => s,
            _ => return Err(compile_err(pos, format!("expected a literal for {}", attr))),
        };

        match attr {
            Attr::OsVersion | Attr::AppVersion => text
                .parse::<Version>()
                .map(Operand::Version)
                .map_err(|e| compile_err(pos, e.to_string())),
            _ if !op.is_equality() => Err(compile_err(
                pos,
                format!("{} only supports ==, != and in", attr),
            )),
            Attr::Ip => text
                .parse::<IpRange>()
                .map(Operand::Ip)
                .map_err(|e| compile_err(pos, e.to_string())),
            Attr::OsType | Attr::Lang => Ok(Operand::Text(text.to_ascii_lowercase())),
            Attr::DeviceId => Ok(Operand::Text(text)),
        }
    }
}
