//! A minimal expression parser for annotations and default values.
//!
//! The DSL only ever needs a closed grammar: a bare name, a call whose
//! arguments are all keyword literals, a string literal, numeric/boolean/None
//! literals, attribute chains, unary minus, and the special name `NULL`.
//! Everything else is rejected; calls, comprehensions, and collection
//! literals cannot be rendered as C defaults anyway.

use std::fmt::Write;

use crate::errors::{ClinicError, ClinicResult, fail};

/// A literal value evaluated from a default expression or annotation kwarg.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Imaginary literal, e.g. `1j`. Stored as the imaginary magnitude.
    Complex(f64),
    Str(String),
}

impl Literal {
    /// Python-surface rendering, matching `repr()` for the supported types.
    #[must_use]
    pub fn py_repr(&self) -> String {
        match self {
            Self::None => "None".to_owned(),
            Self::Bool(true) => "True".to_owned(),
            Self::Bool(false) => "False".to_owned(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => py_float_repr(*v),
            Self::Complex(v) => format!("{}j", py_float_repr_bare(*v)),
            Self::Str(s) => py_str_repr(s),
        }
    }

    /// C-surface rendering of the literal, used as the generated default.
    #[must_use]
    pub fn c_repr(&self) -> String {
        match self {
            Self::None => "Py_None".to_owned(),
            Self::Bool(true) => "Py_True".to_owned(),
            Self::Bool(false) => "Py_False".to_owned(),
            Self::Str(s) => c_str_repr(s),
            other => other.py_repr(),
        }
    }
}

fn py_float_repr(v: f64) -> String {
    if v.is_finite() && v == v.trunc() && v.abs() < 1e16 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

fn py_float_repr_bare(v: f64) -> String {
    if v.is_finite() && v == v.trunc() && v.abs() < 1e16 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

fn py_str_repr(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Renders a string as a double-quoted C literal.
#[must_use]
pub fn c_str_repr(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 || (c as u32) >= 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// A parsed expression from the closed grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    /// A bare identifier (`NULL`, a named constant, a converter name).
    Name(String),
    /// A dotted attribute chain rooted at a name, e.g. `sys.maxsize`.
    Attribute(Vec<String>),
    /// `name(kw=literal, ...)`, the only call form the grammar admits.
    Call { func: String, kwargs: Vec<(String, Literal)> },
}

impl Expr {
    /// Evaluates the expression to a literal if it is one.
    #[must_use]
    pub fn as_literal(&self) -> Option<&Literal> {
        match self {
            Self::Literal(lit) => Some(lit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Literal(Literal),
    LParen,
    RParen,
    Comma,
    Equals,
    Dot,
    Minus,
    Star,
    Colon,
}

struct Lexer<'a> {
    src: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().peekable(),
        }
    }

    fn tokenize(mut self) -> ClinicResult<Vec<Token>> {
        let mut tokens = Vec::new();
        while let Some(&(start, c)) = self.chars.peek() {
            match c {
                c if c.is_whitespace() => {
                    self.chars.next();
                }
                '(' => tokens.push(self.punct(Token::LParen)),
                ')' => tokens.push(self.punct(Token::RParen)),
                ',' => tokens.push(self.punct(Token::Comma)),
                '=' => tokens.push(self.punct(Token::Equals)),
                '.' => tokens.push(self.punct(Token::Dot)),
                '-' => tokens.push(self.punct(Token::Minus)),
                '*' => tokens.push(self.punct(Token::Star)),
                ':' => tokens.push(self.punct(Token::Colon)),
                '\'' | '"' => tokens.push(Token::Literal(Literal::Str(self.string(c)?))),
                c if c.is_ascii_digit() => tokens.push(Token::Literal(self.number(start)?)),
                c if c.is_alphabetic() || c == '_' => tokens.push(self.name(start)),
                other => fail!("Unexpected character {other:?} in expression {:?}", self.src),
            }
        }
        Ok(tokens)
    }

    fn punct(&mut self, token: Token) -> Token {
        self.chars.next();
        token
    }

    fn string(&mut self, quote: char) -> ClinicResult<String> {
        self.chars.next();
        let mut out = String::new();
        loop {
            match self.chars.next() {
                Some((_, c)) if c == quote => return Ok(out),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, 'r')) => out.push('\r'),
                    Some((_, c)) => out.push(c),
                    None => fail!("Unterminated string in expression {:?}", self.src),
                },
                Some((_, c)) => out.push(c),
                None => fail!("Unterminated string in expression {:?}", self.src),
            }
        }
    }

    fn number(&mut self, start: usize) -> ClinicResult<Literal> {
        let rest = &self.src[start..];
        let is_hex = rest.starts_with("0x") || rest.starts_with("0X");
        let bytes = rest.as_bytes();
        let mut len = 0;
        while len < bytes.len() {
            let c = bytes[len] as char;
            let accept = c.is_ascii_digit()
                || c == '_'
                || c == '.'
                || c == 'j'
                || c == 'J'
                || (is_hex && (c.is_ascii_hexdigit() || c == 'x' || c == 'X'))
                || (!is_hex && (c == 'e' || c == 'E'))
                || (!is_hex
                    && (c == '+' || c == '-')
                    && len > 0
                    && matches!(bytes[len - 1] as char, 'e' | 'E'));
            if !accept {
                break;
            }
            len += 1;
        }
        while let Some(&(i, _)) = self.chars.peek() {
            if i >= start + len {
                break;
            }
            self.chars.next();
        }

        let token = &rest[..len];
        let is_complex = token.ends_with(['j', 'J']);
        let text: String = token
            .trim_end_matches(['j', 'J'])
            .chars()
            .filter(|&c| c != '_')
            .collect();
        let is_float = !is_hex && (text.contains('.') || text.contains(['e', 'E']));
        if is_complex {
            let value: f64 = text
                .parse()
                .map_err(|_| ClinicError::new(format!("Invalid imaginary literal: {token:?}")))?;
            Ok(Literal::Complex(value))
        } else if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| ClinicError::new(format!("Invalid float literal: {token:?}")))?;
            Ok(Literal::Float(value))
        } else if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            let value = i64::from_str_radix(hex, 16)
                .map_err(|_| ClinicError::new(format!("Invalid hex literal: {token:?}")))?;
            Ok(Literal::Int(value))
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| ClinicError::new(format!("Invalid integer literal: {token:?}")))?;
            Ok(Literal::Int(value))
        }
    }

    fn name(&mut self, start: usize) -> Token {
        let mut end = start;
        while let Some(&(i, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.chars.next();
                end = i + c.len_utf8();
            } else {
                break;
            }
        }
        let name = &self.src[start..end];
        match name {
            "None" => Token::Literal(Literal::None),
            "True" => Token::Literal(Literal::Bool(true)),
            "False" => Token::Literal(Literal::Bool(false)),
            other => Token::Name(other.to_owned()),
        }
    }
}

pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(src: &str) -> ClinicResult<Self> {
        Ok(Self {
            tokens: Lexer::new(src).tokenize()?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn at_end(&self) -> bool {
        self.pos == self.tokens.len()
    }

    /// Parses one expression from the closed grammar.
    pub fn expression(&mut self) -> ClinicResult<Expr> {
        if self.eat(&Token::Minus) {
            let operand = self.expression()?;
            let Some(lit) = operand.as_literal() else {
                fail!("Unary minus is only supported on numeric literals.");
            };
            let negated = match lit {
                Literal::Int(v) => Literal::Int(-v),
                Literal::Float(v) => Literal::Float(-v),
                Literal::Complex(v) => Literal::Complex(-v),
                _ => fail!("Unary minus is only supported on numeric literals."),
            };
            return Ok(Expr::Literal(negated));
        }

        match self.advance() {
            Some(Token::Literal(lit)) => Ok(Expr::Literal(lit)),
            Some(Token::Name(name)) => self.after_name(name),
            Some(other) => fail!("Unexpected token {other:?} in expression."),
            None => fail!("Expected an expression, found nothing."),
        }
    }

    fn after_name(&mut self, name: String) -> ClinicResult<Expr> {
        if self.eat(&Token::Dot) {
            let mut parts = vec![name];
            loop {
                match self.advance() {
                    Some(Token::Name(part)) => parts.push(part),
                    _ => fail!("Expected a name after '.' in attribute chain."),
                }
                if !self.eat(&Token::Dot) {
                    break;
                }
            }
            return Ok(Expr::Attribute(parts));
        }
        if self.eat(&Token::LParen) {
            let mut kwargs = Vec::new();
            if !self.eat(&Token::RParen) {
                loop {
                    let Some(Token::Name(kw)) = self.advance() else {
                        fail!("Call arguments in annotations must all be keyword arguments.");
                    };
                    if !self.eat(&Token::Equals) {
                        fail!("Call arguments in annotations must all be keyword arguments.");
                    }
                    let value = self.expression()?;
                    let Some(lit) = value.as_literal() else {
                        fail!("Keyword argument {kw:?} must be a literal value.");
                    };
                    kwargs.push((kw, lit.clone()));
                    if self.eat(&Token::RParen) {
                        break;
                    }
                    if !self.eat(&Token::Comma) {
                        fail!("Expected ',' or ')' in call arguments.");
                    }
                    // trailing comma
                    if self.eat(&Token::RParen) {
                        break;
                    }
                }
            }
            return Ok(Expr::Call { func: name, kwargs });
        }
        Ok(Expr::Name(name))
    }
}

/// Parses a complete expression; trailing tokens are an error.
pub fn parse_expression(src: &str) -> ClinicResult<Expr> {
    let mut parser = Parser::new(src)?;
    let expr = parser.expression()?;
    if !parser.at_end() {
        fail!("Unsupported expression: {src:?}");
    }
    Ok(expr)
}

/// A parsed parameter annotation: the converter name, whether it is a legacy
/// (format-unit string) converter, and the literal keyword arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub name: String,
    pub legacy: bool,
    pub kwargs: Vec<(String, Literal)>,
}

/// Parses an annotation: a bare name, a call with keyword-literal arguments,
/// or a string marking a legacy converter by format unit.
pub fn parse_annotation(src: &str) -> ClinicResult<Annotation> {
    let expr = parse_expression(src)
        .map_err(|_| ClinicError::new("Annotations must be either a name, a function call, or a string."))?;
    match expr {
        Expr::Literal(Literal::Str(unit)) => Ok(Annotation {
            name: unit,
            legacy: true,
            kwargs: Vec::new(),
        }),
        Expr::Name(name) => Ok(Annotation {
            name,
            legacy: false,
            kwargs: Vec::new(),
        }),
        Expr::Call { func, kwargs } => Ok(Annotation {
            name: func,
            legacy: false,
            kwargs,
        }),
        _ => fail!("Annotations must be either a name, a function call, or a string."),
    }
}

/// A parameter declaration line, before marker handling:
/// `[*]name[: annotation]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDecl {
    pub is_vararg: bool,
    pub name: String,
    pub annotation: Option<Annotation>,
}

/// Parses a parameter declaration (without any `= default` part).
pub fn parse_param_decl(src: &str) -> ClinicResult<ParamDecl> {
    let mut parser = Parser::new(src)?;
    let is_vararg = parser.eat(&Token::Star);
    let Some(Token::Name(name)) = parser.advance() else {
        fail!("Invalid parameter declaration: {src:?}");
    };
    let annotation = if parser.eat(&Token::Colon) {
        let expr = parser.expression()?;
        Some(match expr {
            Expr::Literal(Literal::Str(unit)) => Annotation {
                name: unit,
                legacy: true,
                kwargs: Vec::new(),
            },
            Expr::Name(conv) => Annotation {
                name: conv,
                legacy: false,
                kwargs: Vec::new(),
            },
            Expr::Call { func, kwargs } => Annotation {
                name: func,
                legacy: false,
                kwargs,
            },
            _ => fail!("Annotations must be either a name, a function call, or a string."),
        })
    } else {
        None
    };
    if !parser.at_end() {
        fail!("Invalid parameter declaration: {src:?}");
    }
    Ok(ParamDecl {
        is_vararg,
        name,
        annotation,
    })
}

/// Validates a dotted Python identifier (`a.b.c`).
#[must_use]
pub fn is_legal_py_identifier(name: &str) -> bool {
    !name.is_empty() && name.split('.').all(is_legal_c_identifier)
}

/// Validates a C identifier.
#[must_use]
pub fn is_legal_c_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn literal_reprs_match_python() {
        assert_eq!(Literal::None.py_repr(), "None");
        assert_eq!(Literal::Bool(true).py_repr(), "True");
        assert_eq!(Literal::Int(-3).py_repr(), "-3");
        assert_eq!(Literal::Float(1.0).py_repr(), "1.0");
        assert_eq!(Literal::Str("a'b".to_owned()).py_repr(), r"'a\'b'");
    }

    #[test]
    fn c_reprs_use_c_surface_forms() {
        assert_eq!(Literal::None.c_repr(), "Py_None");
        assert_eq!(Literal::Bool(false).c_repr(), "Py_False");
        assert_eq!(Literal::Str("hi\"".to_owned()).c_repr(), "\"hi\\\"\"");
        assert_eq!(Literal::Int(42).c_repr(), "42");
    }

    #[test]
    fn parses_bare_names_and_attributes() {
        assert_eq!(parse_expression("NULL").unwrap(), Expr::Name("NULL".to_owned()));
        assert_eq!(
            parse_expression("sys.maxsize").unwrap(),
            Expr::Attribute(vec!["sys".to_owned(), "maxsize".to_owned()])
        );
    }

    #[test]
    fn parses_calls_with_keyword_literals() {
        let expr = parse_expression("int(c_default='-1')").unwrap();
        assert_eq!(
            expr,
            Expr::Call {
                func: "int".to_owned(),
                kwargs: vec![("c_default".to_owned(), Literal::Str("-1".to_owned()))],
            }
        );
    }

    #[test]
    fn rejects_positional_call_arguments() {
        assert!(parse_expression("int(1)").is_err());
    }

    #[test]
    fn rejects_collection_literals() {
        assert!(parse_expression("[1, 2]").is_err());
        assert!(parse_expression("(1, 2)").is_err());
    }

    #[test]
    fn unary_minus_folds_into_the_literal() {
        assert_eq!(parse_expression("-1").unwrap(), Expr::Literal(Literal::Int(-1)));
        assert_eq!(parse_expression("-1.5").unwrap(), Expr::Literal(Literal::Float(-1.5)));
    }

    #[test]
    fn parses_parameter_declarations() {
        let decl = parse_param_decl("path: str(accept_none=True)").unwrap();
        assert_eq!(decl.name, "path");
        let annotation = decl.annotation.unwrap();
        assert_eq!(annotation.name, "str");
        assert_eq!(annotation.kwargs, vec![("accept_none".to_owned(), Literal::Bool(true))]);
    }

    #[test]
    fn parses_vararg_declarations() {
        let decl = parse_param_decl("*args: object").unwrap();
        assert!(decl.is_vararg);
        assert_eq!(decl.name, "args");
    }

    #[test]
    fn legacy_converters_come_from_string_annotations() {
        let annotation = parse_annotation("'s'").unwrap();
        assert!(annotation.legacy);
        assert_eq!(annotation.name, "s");
    }

    #[test]
    fn identifier_validation() {
        assert!(is_legal_py_identifier("os.path.join"));
        assert!(!is_legal_py_identifier("os..path"));
        assert!(is_legal_c_identifier("_valid2"));
        assert!(!is_legal_c_identifier("2start"));
    }
}
