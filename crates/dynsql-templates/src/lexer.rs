//! Template tokenizer
//!
//! Splits template source into text runs, placeholders and tags while
//! keeping byte offsets for diagnostics. It handles:
//! - `#{...}` and `${...}` placeholders (in text and CDATA sections)
//! - XML entities in text and attribute values
//! - `<![CDATA[ ... ]]>` sections (literal text)
//! - `<!-- comments -->`, `<?xml ... ?>` prologs and `<!DOCTYPE ...>` (dropped)
//!
//! A `<` only starts a tag when followed by an ASCII letter or `/`; any
//! other `<` is plain text.

use crate::error::{ParseErrorKind, SyntaxError};
use crate::fragment::PlaceholderKind;

/// A token of template source
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    /// Literal SQL text with entities decoded
    Text(String),
    /// `#{body}` or `${body}`
    Placeholder {
        kind: PlaceholderKind,
        body: String,
        body_offset: usize,
    },
    /// `<name attr="value">` or `<name/>`
    OpenTag {
        name: String,
        attributes: Vec<Attribute>,
        self_closing: bool,
    },
    /// `</name>`
    CloseTag { name: String },
    /// End of input
    Eof,
}

/// A tag attribute with its decoded value
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Attribute {
    pub name: String,
    pub value: String,
    pub name_offset: usize,
    pub value_offset: usize,
}

/// Token with its starting byte offset
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PositionedToken {
    pub token: Token,
    pub start: usize,
}

/// Tokenizer for template and mapper source
pub(crate) struct Lexer<'a> {
    input: &'a str,
    position: usize,
    tokens: Vec<PositionedToken>,
    text: String,
    text_start: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            position: 0,
            tokens: Vec::new(),
            text: String::new(),
            text_start: 0,
        }
    }

    /// Tokenize the entire input. The last token is always `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<PositionedToken>, SyntaxError> {
        while !self.is_eof() {
            let rest = self.rest();
            if rest.starts_with("<!--") {
                self.skip_comment()?;
            } else if rest.starts_with("<![CDATA[") {
                self.read_cdata()?;
            } else if rest.starts_with("<?") {
                self.skip_until("?>", "unterminated processing instruction")?;
            } else if rest.starts_with("<!") {
                self.skip_until(">", "unterminated declaration")?;
            } else if rest.starts_with("</") && starts_with_letter(&rest[2..]) {
                self.flush_text();
                self.read_close_tag()?;
            } else if rest.starts_with('<') && starts_with_letter(&rest[1..]) {
                self.flush_text();
                self.read_open_tag()?;
            } else if rest.starts_with("#{") || rest.starts_with("${") {
                self.read_placeholder()?;
            } else if rest.starts_with('&') {
                self.read_entity();
            } else {
                self.push_char();
            }
        }
        self.flush_text();
        self.tokens.push(PositionedToken {
            token: Token::Eof,
            start: self.input.len(),
        });
        Ok(self.tokens)
    }

    fn rest(&self) -> &'a str {
        &self.input[self.position..]
    }

    fn is_eof(&self) -> bool {
        self.position >= self.input.len()
    }

    fn current_char(&self) -> char {
        self.rest().chars().next().unwrap_or('\0')
    }

    fn push_char(&mut self) {
        let input = self.input;
        if let Some(ch) = self.rest().chars().next() {
            self.append_text(&input[self.position..self.position + ch.len_utf8()]);
            self.position += ch.len_utf8();
        }
    }

    fn append_text(&mut self, s: &str) {
        if self.text.is_empty() {
            self.text_start = self.position;
        }
        self.text.push_str(s);
    }

    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            self.tokens.push(PositionedToken {
                token: Token::Text(std::mem::take(&mut self.text)),
                start: self.text_start,
            });
        }
    }

    fn skip_comment(&mut self) -> Result<(), SyntaxError> {
        match self.rest().find("-->") {
            Some(end) => {
                self.position += end + 3;
                Ok(())
            }
            None => Err(SyntaxError::new(
                ParseErrorKind::UnterminatedComment,
                self.position,
            )),
        }
    }

    fn skip_until(&mut self, terminator: &str, message: &str) -> Result<(), SyntaxError> {
        match self.rest().find(terminator) {
            Some(end) => {
                self.position += end + terminator.len();
                Ok(())
            }
            None => Err(SyntaxError::new(
                ParseErrorKind::MalformedTag {
                    message: message.to_string(),
                },
                self.position,
            )),
        }
    }

    /// CDATA content is literal text, but placeholders inside it still count
    fn read_cdata(&mut self) -> Result<(), SyntaxError> {
        let start = self.position;
        let content_start = start + "<![CDATA[".len();
        let Some(len) = self.input[content_start..].find("]]>") else {
            return Err(SyntaxError::new(ParseErrorKind::UnterminatedCdata, start));
        };
        let content_end = content_start + len;
        self.position = content_start;
        while self.position < content_end {
            let rest = &self.input[self.position..content_end];
            if rest.starts_with("#{") || rest.starts_with("${") {
                self.read_placeholder()?;
                if self.position > content_end {
                    return Err(SyntaxError::new(
                        ParseErrorKind::MalformedPlaceholder {
                            message: "placeholder crosses the end of a CDATA section".into(),
                        },
                        self.position,
                    ));
                }
            } else {
                self.push_char();
            }
        }
        self.position = content_end + 3;
        Ok(())
    }

    fn read_placeholder(&mut self) -> Result<(), SyntaxError> {
        let input = self.input;
        let start = self.position;
        let kind = if self.rest().starts_with('#') {
            PlaceholderKind::Bound
        } else {
            PlaceholderKind::Raw
        };
        let body_offset = start + 2;
        let Some(len) = input[body_offset..].find('}') else {
            return Err(SyntaxError::new(
                ParseErrorKind::UnterminatedPlaceholder,
                start,
            ));
        };
        let body = &input[body_offset..body_offset + len];
        if body.contains(['{', '\n']) {
            return Err(SyntaxError::new(
                ParseErrorKind::UnterminatedPlaceholder,
                start,
            ));
        }
        self.flush_text();
        self.tokens.push(PositionedToken {
            token: Token::Placeholder {
                kind,
                body: body.to_string(),
                body_offset,
            },
            start,
        });
        self.position = body_offset + len + 1;
        Ok(())
    }

    fn read_entity(&mut self) {
        let rest = self.rest();
        if let Some((decoded, len)) = decode_entity(rest) {
            let mut buf = [0u8; 4];
            self.append_text(decoded.encode_utf8(&mut buf));
            self.position += len;
        } else {
            self.push_char();
        }
    }

    fn read_name(&mut self) -> String {
        let start = self.position;
        while !self.is_eof() {
            let ch = self.current_char();
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | ':' | '.') {
                self.position += ch.len_utf8();
            } else {
                break;
            }
        }
        self.input[start..self.position].to_string()
    }

    fn skip_whitespace(&mut self) {
        while !self.is_eof() && self.current_char().is_whitespace() {
            self.position += self.current_char().len_utf8();
        }
    }

    fn read_close_tag(&mut self) -> Result<(), SyntaxError> {
        let start = self.position;
        self.position += 2;
        let name = self.read_name();
        self.skip_whitespace();
        if self.current_char() != '>' {
            return Err(SyntaxError::new(
                ParseErrorKind::MalformedTag {
                    message: format!("expected `>` to close </{name}"),
                },
                start,
            ));
        }
        self.position += 1;
        self.tokens.push(PositionedToken {
            token: Token::CloseTag { name },
            start,
        });
        Ok(())
    }

    fn read_open_tag(&mut self) -> Result<(), SyntaxError> {
        let start = self.position;
        self.position += 1;
        let name = self.read_name();
        let mut attributes = Vec::new();

        loop {
            self.skip_whitespace();
            if self.is_eof() {
                return Err(SyntaxError::new(
                    ParseErrorKind::MalformedTag {
                        message: format!("<{name}> is never closed with `>`"),
                    },
                    start,
                ));
            }
            let rest = self.rest();
            if rest.starts_with("/>") {
                self.position += 2;
                self.tokens.push(PositionedToken {
                    token: Token::OpenTag {
                        name,
                        attributes,
                        self_closing: true,
                    },
                    start,
                });
                return Ok(());
            }
            if rest.starts_with('>') {
                self.position += 1;
                self.tokens.push(PositionedToken {
                    token: Token::OpenTag {
                        name,
                        attributes,
                        self_closing: false,
                    },
                    start,
                });
                return Ok(());
            }
            attributes.push(self.read_attribute(&name)?);
        }
    }

    fn read_attribute(&mut self, tag: &str) -> Result<Attribute, SyntaxError> {
        let name_offset = self.position;
        let name = self.read_name();
        if name.is_empty() {
            return Err(SyntaxError::new(
                ParseErrorKind::MalformedTag {
                    message: format!("unexpected `{}` in <{tag}>", self.current_char()),
                },
                name_offset,
            ));
        }
        self.skip_whitespace();
        if self.current_char() != '=' {
            return Err(SyntaxError::new(
                ParseErrorKind::MalformedTag {
                    message: format!("attribute `{name}` has no value"),
                },
                name_offset,
            ));
        }
        self.position += 1;
        self.skip_whitespace();
        let quote = self.current_char();
        if quote != '"' && quote != '\'' {
            return Err(SyntaxError::new(
                ParseErrorKind::MalformedTag {
                    message: format!("value of `{name}` must be quoted"),
                },
                self.position,
            ));
        }
        let value_offset = self.position + 1;
        let Some(len) = self.input[value_offset..].find(quote) else {
            return Err(SyntaxError::new(
                ParseErrorKind::MalformedTag {
                    message: format!("unterminated value of `{name}`"),
                },
                self.position,
            ));
        };
        let value = decode_entities(&self.input[value_offset..value_offset + len]);
        self.position = value_offset + len + 1;
        Ok(Attribute {
            name,
            value,
            name_offset,
            value_offset,
        })
    }
}

fn starts_with_letter(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
}

/// Decode one entity at the start of `s`, returning the character and the
/// number of bytes consumed
fn decode_entity(s: &str) -> Option<(char, usize)> {
    let (end, _) = s.char_indices().take(12).find(|&(_, c)| c == ';')?;
    let name = &s[1..end];
    let ch = match name {
        "lt" => '<',
        "gt" => '>',
        "amp" => '&',
        "quot" => '"',
        "apos" => '\'',
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()?
            } else if let Some(dec) = name.strip_prefix('#') {
                dec.parse::<u32>().ok()?
            } else {
                return None;
            };
            char::from_u32(code)?
        }
    };
    Some((ch, end + 1))
}

/// Decode every entity in an attribute value; unknown `&` sequences are kept
fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        let rest = &s[i..];
        if rest.starts_with('&') {
            if let Some((ch, len)) = decode_entity(rest) {
                out.push(ch);
                i += len;
                continue;
            }
        }
        let ch = rest.chars().next().unwrap_or('\0');
        out.push(ch);
        i += ch.len_utf8().max(1);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tokens(input: &str) -> Vec<Token> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect()
    }

    #[test]
    fn test_text_and_placeholders() {
        let toks = tokens("id = #{id} AND t = ${table}");
        assert_eq!(
            toks,
            vec![
                Token::Text("id = ".into()),
                Token::Placeholder {
                    kind: PlaceholderKind::Bound,
                    body: "id".into(),
                    body_offset: 7,
                },
                Token::Text(" AND t = ".into()),
                Token::Placeholder {
                    kind: PlaceholderKind::Raw,
                    body: "table".into(),
                    body_offset: 21,
                },
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_tags_and_attributes() {
        let toks = tokens(r#"<if test="a &lt; 3">x</if><bind name='p' value="1"/>"#);
        match &toks[0] {
            Token::OpenTag {
                name,
                attributes,
                self_closing,
            } => {
                assert_eq!(name, "if");
                assert!(!self_closing);
                assert_eq!(attributes[0].name, "test");
                assert_eq!(attributes[0].value, "a < 3");
                assert_eq!(attributes[0].value_offset, 10);
            }
            other => panic!("unexpected token {:?}", other),
        }
        assert_eq!(toks[1], Token::Text("x".into()));
        assert_eq!(toks[2], Token::CloseTag { name: "if".into() });
        assert!(matches!(&toks[3], Token::OpenTag { self_closing: true, .. }));
    }

    #[test]
    fn test_less_than_in_sql_is_text() {
        let toks = tokens("a < 3 AND b <= 4");
        assert_eq!(toks, vec![Token::Text("a < 3 AND b <= 4".into()), Token::Eof]);
    }

    #[test]
    fn test_entities_and_cdata() {
        let toks = tokens("a &lt; #{x} <![CDATA[ AND b < #{y} ]]>&#65;");
        assert_eq!(toks[0], Token::Text("a < ".into()));
        assert!(matches!(&toks[1], Token::Placeholder { body, .. } if body == "x"));
        assert_eq!(toks[2], Token::Text("  AND b < ".into()));
        assert!(matches!(&toks[3], Token::Placeholder { body, .. } if body == "y"));
        assert_eq!(toks[4], Token::Text(" A".into()));
    }

    #[test]
    fn test_comments_and_prolog_dropped() {
        let toks = tokens("<?xml version=\"1.0\"?><!DOCTYPE mapper>SELECT <!-- note -->1");
        assert_eq!(toks, vec![Token::Text("SELECT 1".into()), Token::Eof]);
    }

    #[test]
    fn test_unterminated_placeholder() {
        let err = Lexer::new("SELECT #{id").tokenize().unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnterminatedPlaceholder);
        assert_eq!(err.offset, 7);
    }

    #[test]
    fn test_unterminated_cdata_and_comment() {
        let err = Lexer::new("x <![CDATA[ y").tokenize().unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnterminatedCdata);
        let err = Lexer::new("x <!-- y").tokenize().unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnterminatedComment);
    }

    #[test]
    fn test_unquoted_attribute_is_malformed() {
        let err = Lexer::new("<if test=a>").tokenize().unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::MalformedTag { .. }));
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("a &amp;&amp; b"), "a && b");
        assert_eq!(decode_entities("x &gt;= &#x31;"), "x >= 1");
        assert_eq!(decode_entities("AND &unknown"), "AND &unknown");
    }

    #[test]
    fn test_ampersand_before_multibyte_text() {
        let toks = tokens("note = 'R&中文中文' AND x = 'a&amp;中'");
        assert_eq!(
            toks,
            vec![Token::Text("note = 'R&中文中文' AND x = 'a&中'".into()), Token::Eof]
        );

        let toks = tokens(r#"<if test="note == 'R&中文中文;'">x</if>"#);
        match &toks[0] {
            Token::OpenTag { attributes, .. } => {
                assert_eq!(attributes[0].value, "note == 'R&中文中文;'");
            }
            other => panic!("unexpected token {:?}", other),
        }
        assert_eq!(decode_entities("&中文中文中文中文"), "&中文中文中文中文");
        assert_eq!(decode_entities("&#20013;"), "中");
    }
}
