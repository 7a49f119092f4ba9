//! Recursive-descent parser for test and value expressions
//!
//! Precedence, lowest first: `||`, `&&`, equality, comparison, additive,
//! multiplicative, unary, postfix (`.field`, `[index]`, `.method()`).

use dynsql_core::Value;

use super::ast::{BinaryOp, Expr, Function, Path, Segment, UnaryOp};
use crate::error::{ParseErrorKind, SyntaxError};

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Eof,
}

/// Parse `text`, reporting errors relative to `base_offset`
pub(crate) fn parse_expression(text: &str, base_offset: usize) -> Result<Expr, SyntaxError> {
    let tokens = tokenize(text, base_offset)?;
    let mut parser = ExprParser {
        tokens,
        pos: 0,
        end_offset: base_offset + text.len(),
    };
    if matches!(parser.peek(), Tok::Eof) {
        return Err(malformed("empty expression", base_offset));
    }
    let expr = parser.parse_or()?;
    match parser.peek() {
        Tok::Eof => Ok(expr),
        other => Err(malformed(
            format!("unexpected {} after expression", describe(other)),
            parser.offset(),
        )),
    }
}

fn malformed(message: impl Into<String>, offset: usize) -> SyntaxError {
    SyntaxError::new(
        ParseErrorKind::MalformedExpression {
            message: message.into(),
        },
        offset,
    )
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Ident(name) => format!("`{}`", name),
        Tok::Int(v) => format!("`{}`", v),
        Tok::Float(v) => format!("`{}`", v),
        Tok::Str(_) => "string literal".into(),
        Tok::Op(op) => format!("`{}`", op),
        Tok::LParen => "`(`".into(),
        Tok::RParen => "`)`".into(),
        Tok::LBracket => "`[`".into(),
        Tok::RBracket => "`]`".into(),
        Tok::Dot => "`.`".into(),
        Tok::Comma => "`,`".into(),
        Tok::Eof => "end of expression".into(),
    }
}

fn tokenize(text: &str, base: usize) -> Result<Vec<(Tok, usize)>, SyntaxError> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < text.len() {
        let ch = text[i..].chars().next().unwrap_or('\0');
        let start = i;

        if ch.is_whitespace() {
            i += ch.len_utf8();
            continue;
        }

        if ch.is_ascii_alphabetic() || ch == '_' {
            while i < text.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push((Tok::Ident(text[start..i].to_string()), base + start));
            continue;
        }

        if ch.is_ascii_digit() {
            while i < text.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let is_float = i + 1 < text.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit();
            if is_float {
                i += 1;
                while i < text.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let value = text[start..i]
                    .parse::<f64>()
                    .map_err(|e| malformed(format!("invalid number: {}", e), base + start))?;
                tokens.push((Tok::Float(value), base + start));
            } else {
                let value = text[start..i]
                    .parse::<i64>()
                    .map_err(|_| malformed("integer literal out of range", base + start))?;
                tokens.push((Tok::Int(value), base + start));
            }
            continue;
        }

        if ch == '\'' || ch == '"' {
            i += 1;
            let mut value = String::new();
            let mut closed = false;
            while i < text.len() {
                let c = text[i..].chars().next().unwrap_or('\0');
                i += c.len_utf8();
                if c == ch {
                    closed = true;
                    break;
                }
                if c == '\\' {
                    let escaped = text[i..].chars().next().unwrap_or('\0');
                    i += escaped.len_utf8();
                    value.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                } else {
                    value.push(c);
                }
            }
            if !closed {
                return Err(malformed("unterminated string literal", base + start));
            }
            tokens.push((Tok::Str(value), base + start));
            continue;
        }

        let two = text.get(i..i + 2).unwrap_or("");
        let op = match two {
            "&&" => Some("&&"),
            "||" => Some("||"),
            "==" => Some("=="),
            "!=" => Some("!="),
            "<=" => Some("<="),
            ">=" => Some(">="),
            _ => None,
        };
        if let Some(op) = op {
            tokens.push((Tok::Op(op), base + start));
            i += 2;
            continue;
        }

        let tok = match ch {
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            '[' => Tok::LBracket,
            ']' => Tok::RBracket,
            '.' => Tok::Dot,
            ',' => Tok::Comma,
            '!' => Tok::Op("!"),
            '<' => Tok::Op("<"),
            '>' => Tok::Op(">"),
            '+' => Tok::Op("+"),
            '-' => Tok::Op("-"),
            '*' => Tok::Op("*"),
            '/' => Tok::Op("/"),
            '%' => Tok::Op("%"),
            other => {
                return Err(malformed(
                    format!("unexpected character `{}`", other),
                    base + start,
                ));
            }
        };
        tokens.push((tok, base + start));
        i += ch.len_utf8();
    }

    tokens.push((Tok::Eof, base + text.len()));
    Ok(tokens)
}

struct ExprParser {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
    end_offset: usize,
}

impl ExprParser {
    fn peek(&self) -> &Tok {
        self.tokens.get(self.pos).map_or(&Tok::Eof, |(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or(self.end_offset, |(_, o)| *o)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: Tok) -> Result<(), SyntaxError> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(malformed(
                format!(
                    "expected {}, found {}",
                    describe(&expected),
                    describe(self.peek())
                ),
                self.offset(),
            ))
        }
    }

    /// Match a symbolic operator or its keyword alias
    fn eat_op(&mut self, symbols: &[&str], keywords: &[&str]) -> Option<&'static str> {
        let matched = match self.peek() {
            Tok::Op(op) if symbols.contains(op) => Some(*op),
            Tok::Ident(word) => keywords
                .iter()
                .position(|k| *k == word.as_str())
                .map(|i| keyword_symbol(keywords[i])),
            _ => None,
        };
        if matched.is_some() {
            self.advance();
        }
        matched
    }

    fn parse_or(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_and()?;
        while self.eat_op(&["||"], &["or"]).is_some() {
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_equality()?;
        while self.eat_op(&["&&"], &["and"]).is_some() {
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_comparison()?;
        while let Some(op) = self.eat_op(&["==", "!="], &["eq", "neq"]) {
            let right = self.parse_comparison()?;
            let op = if op == "==" { BinaryOp::Eq } else { BinaryOp::Ne };
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_additive()?;
        while let Some(op) = self.eat_op(&["<", "<=", ">", ">="], &["lt", "lte", "gt", "gte"]) {
            let right = self.parse_additive()?;
            let op = match op {
                "<" => BinaryOp::Lt,
                "<=" => BinaryOp::Le,
                ">" => BinaryOp::Gt,
                _ => BinaryOp::Ge,
            };
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_multiplicative()?;
        while let Some(op) = self.eat_op(&["+", "-"], &[]) {
            let right = self.parse_multiplicative()?;
            let op = if op == "+" { BinaryOp::Add } else { BinaryOp::Sub };
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "%"], &[]) {
            let right = self.parse_unary()?;
            let op = match op {
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                _ => BinaryOp::Rem,
            };
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat_op(&["!"], &["not"]).is_some() {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        if self.eat_op(&["-"], &[]).is_some() {
            let operand = self.parse_unary()?;
            return Ok(match operand {
                Expr::Literal(Value::Int(v)) => Expr::Literal(Value::Int(-v)),
                Expr::Literal(Value::Float(v)) => Expr::Literal(Value::Float(-v)),
                operand => Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Tok::Dot => {
                    let dot_offset = self.offset();
                    self.advance();
                    let name_offset = self.offset();
                    let Tok::Ident(name) = self.advance() else {
                        return Err(malformed("expected a name after `.`", name_offset));
                    };
                    if matches!(self.peek(), Tok::LParen) {
                        expr = self.parse_call(&name, name_offset, Some(expr))?;
                    } else {
                        match &mut expr {
                            Expr::Path(path) => path.segments.push(Segment::Field(name)),
                            _ => {
                                return Err(malformed(
                                    format!("cannot access `.{}` on a computed value", name),
                                    dot_offset,
                                ));
                            }
                        }
                    }
                }
                Tok::LBracket => {
                    let bracket_offset = self.offset();
                    self.advance();
                    let index = self.parse_or()?;
                    self.expect(Tok::RBracket)?;
                    match &mut expr {
                        Expr::Path(path) => path.segments.push(Segment::Index(Box::new(index))),
                        _ => {
                            return Err(malformed(
                                "cannot index a computed value",
                                bracket_offset,
                            ));
                        }
                    }
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, SyntaxError> {
        let offset = self.offset();
        match self.advance() {
            Tok::Int(v) => Ok(Expr::Literal(Value::Int(v))),
            Tok::Float(v) => Ok(Expr::Literal(Value::Float(v))),
            Tok::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Tok::LParen => {
                let expr = self.parse_or()?;
                self.expect(Tok::RParen)?;
                Ok(expr)
            }
            Tok::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if is_keyword(&name) => Err(malformed(
                    format!("unexpected keyword `{}`", name),
                    offset,
                )),
                _ if matches!(self.peek(), Tok::LParen) => self.parse_call(&name, offset, None),
                _ => Ok(Expr::Path(Path {
                    root: name,
                    segments: Vec::new(),
                })),
            },
            other => Err(malformed(
                format!("unexpected {}", describe(&other)),
                offset,
            )),
        }
    }

    /// Parse `name(args)`; `receiver` is the left side of method syntax
    fn parse_call(
        &mut self,
        name: &str,
        name_offset: usize,
        receiver: Option<Expr>,
    ) -> Result<Expr, SyntaxError> {
        let Some(function) = Function::from_name(name) else {
            return Err(SyntaxError::new(
                ParseErrorKind::UnknownFunction {
                    name: name.to_string(),
                },
                name_offset,
            ));
        };
        self.expect(Tok::LParen)?;
        let mut args: Vec<Expr> = receiver.into_iter().collect();
        if !matches!(self.peek(), Tok::RParen) {
            loop {
                args.push(self.parse_or()?);
                if matches!(self.peek(), Tok::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(Tok::RParen)?;
        if args.len() != function.arity() {
            return Err(malformed(
                format!(
                    "`{}` takes {} argument(s), found {}",
                    function.name(),
                    function.arity(),
                    args.len()
                ),
                name_offset,
            ));
        }
        Ok(Expr::Call { function, args })
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn keyword_symbol(keyword: &str) -> &'static str {
    match keyword {
        "or" => "||",
        "and" => "&&",
        "not" => "!",
        "eq" => "==",
        "neq" => "!=",
        "lt" => "<",
        "lte" => "<=",
        "gt" => ">",
        _ => ">=",
    }
}

fn is_keyword(word: &str) -> bool {
    matches!(
        word,
        "and" | "or" | "not" | "eq" | "neq" | "lt" | "lte" | "gt" | "gte"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(text: &str) -> Expr {
        parse_expression(text, 0).unwrap()
    }

    fn path(root: &str, fields: &[&str]) -> Expr {
        Expr::Path(Path {
            root: root.into(),
            segments: fields
                .iter()
                .map(|f| Segment::Field(f.to_string()))
                .collect(),
        })
    }

    #[test]
    fn test_precedence() {
        let expr = parse("a || b && c == 1");
        assert_eq!(expr.to_string(), "(a || (b && (c == 1)))");

        let expr = parse("1 + 2 * 3 - 4");
        assert_eq!(expr.to_string(), "((1 + (2 * 3)) - 4)");
    }

    #[test]
    fn test_keyword_aliases() {
        assert_eq!(parse("a gt 1 and b lte 2").to_string(), "((a > 1) && (b <= 2))");
        assert_eq!(parse("not a or b neq null").to_string(), "(!a || (b != null))");
    }

    #[test]
    fn test_nested_path() {
        assert_eq!(parse("user.address.city"), path("user", &["address", "city"]));
        assert_eq!(parse("rows[i + 1].name").to_string(), "rows[(i + 1)].name");
    }

    #[test]
    fn test_method_sugar() {
        assert_eq!(
            parse("list.isEmpty()"),
            Expr::Call {
                function: Function::IsEmpty,
                args: vec![path("list", &[])],
            }
        );
        assert_eq!(parse("name.contains('x')").to_string(), "contains(name, 'x')");
        assert_eq!(parse("!ids.isEmpty()").to_string(), "!isEmpty(ids)");
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse("-3"), Expr::Literal(Value::Int(-3)));
        assert_eq!(parse("2.5"), Expr::Literal(Value::Float(2.5)));
        assert_eq!(parse("\"it's\""), Expr::Literal(Value::from("it's")));
        assert_eq!(parse("'a\\'b'"), Expr::Literal(Value::from("a'b")));
    }

    #[test]
    fn test_unknown_function() {
        let err = parse_expression("a.toUpperCase()", 10).unwrap_err();
        assert_eq!(
            err.kind,
            ParseErrorKind::UnknownFunction {
                name: "toUpperCase".into()
            }
        );
        assert_eq!(err.offset, 12);
    }

    #[test]
    fn test_wrong_arity() {
        let err = parse_expression("size(a, b)", 0).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::MalformedExpression { .. }));
        assert!(parse_expression("contains(a)", 0).is_err());
    }

    #[test]
    fn test_malformed() {
        for text in ["", "a +", "(a", "a b", "'open", "a = 1", "1.x"] {
            let err = parse_expression(text, 0).unwrap_err();
            assert!(
                matches!(err.kind, ParseErrorKind::MalformedExpression { .. }),
                "{text}: {err:?}"
            );
        }
    }
}
