//! Recursive-descent parser from tokens to a fragment tree

use crate::error::{ParseError, ParseErrorKind, SyntaxError};
use crate::expr::Expression;
use crate::fragment::{
    Foreach, Fragment, Placeholder, PlaceholderKind, Trim, WhenBranch, parse_overrides,
};
use crate::functions::{SqlFunctionArg, parse_call, split_top_level};
use crate::lexer::{Attribute, Lexer, PositionedToken, Token};
use crate::source::TemplateSource;

/// Whether `<include>` is allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// A standalone template
    Template,
    /// The body of a mapper statement or `<sql>` fragment
    Mapper,
}

/// Parse a standalone template into its fragment tree
pub fn parse(source: &TemplateSource) -> Result<Vec<Fragment>, ParseError> {
    let text = source.text();
    parse_text(text, ParseMode::Template).map_err(|e| e.into_parse_error(text))
}

pub(crate) fn parse_text(text: &str, mode: ParseMode) -> Result<Vec<Fragment>, SyntaxError> {
    let tokens = Lexer::new(text).tokenize()?;
    let mut parser = FragmentParser::new(&tokens, mode);
    parser.parse_body(None)
}

/// Attribute rules of a directive
struct TagSpec {
    required: &'static [&'static str],
    optional: &'static [&'static str],
}

fn tag_spec(name: &str) -> Option<TagSpec> {
    let (required, optional): (&[&str], &[&str]) = match name {
        "if" | "when" => (&["test"], &[]),
        "choose" | "otherwise" | "where" | "set" => (&[], &[]),
        "foreach" => (
            &["collection"],
            &["item", "index", "open", "close", "separator"],
        ),
        "trim" => (
            &[],
            &["prefix", "suffix", "prefixOverrides", "suffixOverrides"],
        ),
        "bind" => (&["name", "value"], &[]),
        "include" => (&["refid"], &[]),
        _ => return None,
    };
    Some(TagSpec { required, optional })
}

/// Validate attributes against the tag's rules
pub(crate) fn check_attributes(
    tag: &str,
    attributes: &[Attribute],
    required: &[&str],
    optional: &[&str],
    tag_offset: usize,
) -> Result<(), SyntaxError> {
    for (i, attr) in attributes.iter().enumerate() {
        if attributes[..i].iter().any(|a| a.name == attr.name) {
            return Err(SyntaxError::new(
                ParseErrorKind::DuplicateAttribute {
                    tag: tag.to_string(),
                    attribute: attr.name.clone(),
                },
                attr.name_offset,
            ));
        }
        if !required.contains(&attr.name.as_str()) && !optional.contains(&attr.name.as_str()) {
            return Err(SyntaxError::new(
                ParseErrorKind::UnknownAttribute {
                    tag: tag.to_string(),
                    attribute: attr.name.clone(),
                },
                attr.name_offset,
            ));
        }
    }
    for name in required {
        if !attributes.iter().any(|a| a.name == *name) {
            return Err(SyntaxError::new(
                ParseErrorKind::MissingAttribute {
                    tag: tag.to_string(),
                    attribute: name.to_string(),
                },
                tag_offset,
            ));
        }
    }
    Ok(())
}

pub(crate) fn attribute<'a>(attributes: &'a [Attribute], name: &str) -> Option<&'a Attribute> {
    attributes.iter().find(|a| a.name == name)
}

fn attribute_value(attributes: &[Attribute], name: &str) -> Option<String> {
    attribute(attributes, name).map(|a| a.value.clone())
}

fn expression_attribute(attributes: &[Attribute], name: &str) -> Result<Expression, SyntaxError> {
    let attr = attribute(attributes, name).ok_or_else(|| {
        SyntaxError::new(
            ParseErrorKind::MalformedTag {
                message: format!("missing `{}`", name),
            },
            0,
        )
    })?;
    Expression::parse_at(&attr.value, attr.value_offset)
}

fn identifier_attribute(
    attributes: &[Attribute],
    name: &str,
) -> Result<Option<String>, SyntaxError> {
    let Some(attr) = attribute(attributes, name) else {
        return Ok(None);
    };
    let value = attr.value.trim();
    let valid = value
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(SyntaxError::new(
            ParseErrorKind::MalformedTag {
                message: format!("`{}` must be an identifier, found `{}`", name, attr.value),
            },
            attr.value_offset,
        ));
    }
    Ok(Some(value.to_string()))
}

/// Cursor over a token stream producing fragments
pub(crate) struct FragmentParser<'t> {
    tokens: &'t [PositionedToken],
    pos: usize,
    mode: ParseMode,
}

impl<'t> FragmentParser<'t> {
    pub fn new(tokens: &'t [PositionedToken], mode: ParseMode) -> Self {
        Self {
            tokens,
            pos: 0,
            mode,
        }
    }

    pub fn advance(&mut self) -> Option<&'t PositionedToken> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Parse fragments until the closing tag of `open` (name and offset of
    /// the opening tag), or until the end of input when `open` is `None`.
    pub fn parse_body(&mut self, open: Option<(&str, usize)>) -> Result<Vec<Fragment>, SyntaxError> {
        let mut body = Vec::new();
        loop {
            let Some(token) = self.advance() else {
                return self.end_of_input(open, body);
            };
            match &token.token {
                Token::Eof => return self.end_of_input(open, body),
                Token::Text(text) => body.push(Fragment::Text(text.clone())),
                Token::Placeholder {
                    kind,
                    body: text,
                    body_offset,
                } => body.push(parse_placeholder(*kind, text, *body_offset, token.start)?),
                Token::OpenTag {
                    name,
                    attributes,
                    self_closing,
                } => body.push(self.parse_directive(name, attributes, *self_closing, token.start)?),
                Token::CloseTag { name } => {
                    return match open {
                        Some((expected, _)) if expected == name => Ok(body),
                        Some((expected, _)) => Err(SyntaxError::new(
                            ParseErrorKind::MismatchedClosingTag {
                                expected: expected.to_string(),
                                found: name.clone(),
                            },
                            token.start,
                        )),
                        None => Err(SyntaxError::new(
                            ParseErrorKind::UnexpectedClosingTag { tag: name.clone() },
                            token.start,
                        )),
                    };
                }
            }
        }
    }

    fn end_of_input(
        &self,
        open: Option<(&str, usize)>,
        body: Vec<Fragment>,
    ) -> Result<Vec<Fragment>, SyntaxError> {
        match open {
            Some((tag, offset)) => Err(SyntaxError::new(
                ParseErrorKind::UnterminatedTag {
                    tag: tag.to_string(),
                },
                offset,
            )),
            None => Ok(body),
        }
    }

    fn parse_directive(
        &mut self,
        name: &str,
        attributes: &[Attribute],
        self_closing: bool,
        start: usize,
    ) -> Result<Fragment, SyntaxError> {
        let spec = tag_spec(name).ok_or_else(|| {
            SyntaxError::new(
                ParseErrorKind::UnknownDirective {
                    tag: name.to_string(),
                },
                start,
            )
        })?;

        match name {
            "when" | "otherwise" => {
                return Err(SyntaxError::new(
                    ParseErrorKind::InvalidNesting {
                        message: format!("<{}> must appear directly inside <choose>", name),
                    },
                    start,
                ));
            }
            "include" if self.mode == ParseMode::Template => {
                return Err(SyntaxError::new(ParseErrorKind::IncludeOutsideMapper, start));
            }
            _ => {}
        }

        check_attributes(name, attributes, spec.required, spec.optional, start)?;

        if name == "choose" {
            return self.parse_choose(self_closing, start);
        }

        let body = if self_closing {
            Vec::new()
        } else {
            self.parse_body(Some((name, start)))?
        };

        let fragment = match name {
            "if" => Fragment::If {
                test: expression_attribute(attributes, "test")?,
                body,
                offset: start,
            },
            "foreach" => Fragment::Foreach(Foreach {
                collection: expression_attribute(attributes, "collection")?,
                item: identifier_attribute(attributes, "item")?,
                index: identifier_attribute(attributes, "index")?,
                open: attribute_value(attributes, "open"),
                close: attribute_value(attributes, "close"),
                separator: attribute_value(attributes, "separator"),
                body,
                offset: start,
            }),
            "trim" => Fragment::Trim(Trim {
                prefix: attribute_value(attributes, "prefix"),
                suffix: attribute_value(attributes, "suffix"),
                prefix_overrides: attribute(attributes, "prefixOverrides")
                    .map(|a| parse_overrides(&a.value))
                    .unwrap_or_default(),
                suffix_overrides: attribute(attributes, "suffixOverrides")
                    .map(|a| parse_overrides(&a.value))
                    .unwrap_or_default(),
                body,
            }),
            "where" => Fragment::Trim(Trim::where_clause(body)),
            "set" => Fragment::Trim(Trim::set_clause(body)),
            "bind" => {
                expect_empty(name, &body, start)?;
                Fragment::Bind {
                    name: identifier_attribute(attributes, "name")?.unwrap_or_default(),
                    value: expression_attribute(attributes, "value")?,
                    offset: start,
                }
            }
            _ => {
                expect_empty(name, &body, start)?;
                Fragment::Include {
                    refid: attribute_value(attributes, "refid").unwrap_or_default(),
                    offset: start,
                }
            }
        };
        Ok(fragment)
    }

    fn parse_choose(&mut self, self_closing: bool, start: usize) -> Result<Fragment, SyntaxError> {
        let mut branches = Vec::new();
        let mut otherwise: Option<Vec<Fragment>> = None;
        if self_closing {
            return Ok(Fragment::Choose {
                branches,
                otherwise,
                offset: start,
            });
        }

        loop {
            let token = match self.advance() {
                Some(token) if token.token != Token::Eof => token,
                _ => {
                    return Err(SyntaxError::new(
                        ParseErrorKind::UnterminatedTag {
                            tag: "choose".into(),
                        },
                        start,
                    ));
                }
            };
            match &token.token {
                Token::Eof => {}
                Token::Text(text) if text.trim().is_empty() => {}
                Token::Text(_) | Token::Placeholder { .. } => {
                    return Err(SyntaxError::new(
                        ParseErrorKind::InvalidNesting {
                            message: "only <when> and <otherwise> may appear inside <choose>".into(),
                        },
                        token.start,
                    ));
                }
                Token::CloseTag { name } if name == "choose" => break,
                Token::CloseTag { name } => {
                    return Err(SyntaxError::new(
                        ParseErrorKind::MismatchedClosingTag {
                            expected: "choose".into(),
                            found: name.clone(),
                        },
                        token.start,
                    ));
                }
                Token::OpenTag {
                    name,
                    attributes,
                    self_closing,
                } => {
                    if otherwise.is_some() {
                        return Err(SyntaxError::new(
                            ParseErrorKind::InvalidNesting {
                                message: "<otherwise> must be the last branch of <choose>".into(),
                            },
                            token.start,
                        ));
                    }
                    match name.as_str() {
                        "when" => {
                            check_attributes(name, attributes, &["test"], &[], token.start)?;
                            let body = if *self_closing {
                                Vec::new()
                            } else {
                                self.parse_body(Some(("when", token.start)))?
                            };
                            branches.push(WhenBranch {
                                test: expression_attribute(attributes, "test")?,
                                body,
                            });
                        }
                        "otherwise" => {
                            check_attributes(name, attributes, &[], &[], token.start)?;
                            let body = if *self_closing {
                                Vec::new()
                            } else {
                                self.parse_body(Some(("otherwise", token.start)))?
                            };
                            otherwise = Some(body);
                        }
                        _ => {
                            return Err(SyntaxError::new(
                                ParseErrorKind::InvalidNesting {
                                    message: format!(
                                        "<{}> cannot appear directly inside <choose>",
                                        name
                                    ),
                                },
                                token.start,
                            ));
                        }
                    }
                }
            }
        }

        Ok(Fragment::Choose {
            branches,
            otherwise,
            offset: start,
        })
    }
}

fn expect_empty(tag: &str, body: &[Fragment], start: usize) -> Result<(), SyntaxError> {
    let empty = body
        .iter()
        .all(|f| matches!(f, Fragment::Text(t) if t.trim().is_empty()));
    if empty {
        Ok(())
    } else {
        Err(SyntaxError::new(
            ParseErrorKind::InvalidNesting {
                message: format!("<{}> cannot have content", tag),
            },
            start,
        ))
    }
}

/// Parse the inside of `#{...}` / `${...}`: a property path or, for `#{}`,
/// a SQL function call, optionally followed by `, key=value` options
fn parse_placeholder(
    kind: PlaceholderKind,
    body: &str,
    body_offset: usize,
    start: usize,
) -> Result<Fragment, SyntaxError> {
    // commas inside brackets or quotes belong to the path
    let pieces = split_top_level(body).unwrap_or_else(|| vec![(0, body)]);
    let (path_text, options) = match pieces.split_first() {
        Some(((_, path), options)) => (*path, options),
        None => (body, &[][..]),
    };

    if path_text.trim().is_empty() {
        return Err(SyntaxError::new(
            ParseErrorKind::MalformedPlaceholder {
                message: "empty placeholder".into(),
            },
            start,
        ));
    }

    if let Some(mut call) = parse_call(path_text, body_offset)? {
        let message = match kind {
            PlaceholderKind::Raw => Some("function calls are only allowed in #{...}"),
            PlaceholderKind::Bound if !options.is_empty() => {
                Some("function calls do not take options")
            }
            PlaceholderKind::Bound => None,
        };
        if let Some(message) = message {
            return Err(SyntaxError::new(
                ParseErrorKind::MalformedPlaceholder {
                    message: message.into(),
                },
                start,
            ));
        }
        call.offset = start;
        return Ok(Fragment::SqlFunction(call));
    }

    let path = Expression::parse_at(path_text, body_offset)?;
    if path.as_path().is_none() {
        return Err(SyntaxError::new(
            ParseErrorKind::MalformedPlaceholder {
                message: format!("expected a property path, found `{}`", path.source()),
            },
            body_offset,
        ));
    }

    let options = options
        .iter()
        .map(|(_, option)| match option.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(SyntaxError::new(
                ParseErrorKind::MalformedPlaceholder {
                    message: format!("expected key=value option, found `{}`", option.trim()),
                },
                body_offset,
            )),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Fragment::Placeholder(Placeholder {
        path,
        kind,
        options,
        offset: start,
    }))
}
