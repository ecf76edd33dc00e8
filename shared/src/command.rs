//! Operator command grammar.
//!
//! `<keyword> <arg> <arg> ...`: the keyword is a catalog command name and each
//! declared field consumes exactly one argument, in order. A scalar field takes
//! a bare token, an array field takes one double-quoted token holding exactly
//! N whitespace-separated elements, e.g.
//!
//! ```text
//! setAttitudeTarget "1 0 0 0" 0.05
//! ```

use crate::catalog::{Catalog, MessageKind, Shape};
use crate::error::{CodecError, CodecResult};
use crate::message::{FieldValue, Message, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Bare(&'a str),
    Quoted(&'a str),
}

fn tokenize(args: &str) -> CodecResult<Vec<Token<'_>>> {
    let mut tokens = Vec::new();
    let mut rest = args.trim_start();
    while !rest.is_empty() {
        if let Some(after_quote) = rest.strip_prefix('"') {
            let end = after_quote.find('"').ok_or(CodecError::UnterminatedQuote)?;
            tokens.push(Token::Quoted(&after_quote[..end]));
            rest = &after_quote[end + 1..];
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            let bare = &rest[..end];
            if bare.contains('"') {
                return Err(CodecError::UnexpectedQuote(bare.to_string()));
            }
            tokens.push(Token::Bare(bare));
            rest = &rest[end..];
        }
        rest = rest.trim_start();
    }
    Ok(tokens)
}

/// Split a command line into its keyword and the (possibly empty) remainder.
pub fn split_keyword(text: &str) -> Option<(&str, &str)> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.split_once(char::is_whitespace).unwrap_or((text, "")))
}

pub(crate) fn parse(catalog: &Catalog, text: &str) -> CodecResult<Message> {
    let (keyword, args) = split_keyword(text).ok_or(CodecError::EmptyCommand)?;
    let layout = catalog
        .by_name(keyword)
        .ok_or_else(|| CodecError::UnknownKeyword(keyword.to_string()))?;
    if layout.kind != MessageKind::Command {
        return Err(CodecError::NotACommand(keyword.to_string()));
    }

    let tokens = tokenize(args)?;
    if let Some(extra) = tokens.get(layout.fields.len()) {
        let token = match extra {
            Token::Bare(t) => (*t).to_string(),
            Token::Quoted(t) => format!("\"{t}\""),
        };
        return Err(CodecError::UnexpectedArgument {
            command: layout.name,
            token,
        });
    }

    let mut fields = Vec::with_capacity(layout.fields.len());
    for (i, desc) in layout.fields.iter().enumerate() {
        let token = tokens.get(i).ok_or(CodecError::MissingArgument {
            command: layout.name,
            field: desc.name,
        })?;
        let value = match (desc.shape, *token) {
            (Shape::Scalar, Token::Bare(t)) => FieldValue::Scalar(Value::parse(desc.ty, t, desc.name)?),
            (Shape::Scalar, Token::Quoted(_)) => {
                return Err(CodecError::ExpectedScalar { field: desc.name });
            }
            (Shape::Array(_), Token::Bare(_)) => {
                return Err(CodecError::ExpectedArray { field: desc.name });
            }
            (Shape::Array(n), Token::Quoted(inner)) => {
                let items: Vec<&str> = inner.split_whitespace().collect();
                if items.len() != n {
                    return Err(CodecError::ArrayLength {
                        field: desc.name,
                        expected: n,
                        got: items.len(),
                    });
                }
                let values = items
                    .into_iter()
                    .map(|t| Value::parse(desc.ty, t, desc.name))
                    .collect::<CodecResult<Vec<_>>>()?;
                FieldValue::Array(values)
            }
        };
        fields.push(value);
    }
    Message::new(layout, fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_std(text: &str) -> CodecResult<Message> {
        Catalog::standard().parse_command(text)
    }

    #[test]
    fn scalar_command() {
        let msg = parse_std("setOpmode 3").unwrap();
        assert_eq!(msg.code(), 0);
        assert_eq!(msg.fields(), &[FieldValue::Scalar(Value::U8(3))]);
        assert_eq!(msg.encode(), vec![0, 3]);
    }

    #[test]
    fn quoted_tokens_become_array_elements() {
        let msg = parse_std("  setAttitudeTarget   \" 1 0  0 0 \"  0.05\n").unwrap();
        assert_eq!(msg.code(), 1);
        assert_eq!(
            msg.fields()[0],
            FieldValue::Array(vec![
                Value::F32(1.0),
                Value::F32(0.0),
                Value::F32(0.0),
                Value::F32(0.0)
            ])
        );
        assert_eq!(msg.fields()[1], FieldValue::Scalar(Value::F32(0.05)));
    }

    #[test]
    fn malformed_commands_are_errors() {
        assert_eq!(parse_std(""), Err(CodecError::EmptyCommand));
        assert_eq!(parse_std("   \t"), Err(CodecError::EmptyCommand));
        assert_eq!(
            parse_std("fireThrusters 1"),
            Err(CodecError::UnknownKeyword("fireThrusters".into()))
        );
        assert_eq!(
            parse_std("attitudeADCS"),
            Err(CodecError::NotACommand("attitudeADCS".into()))
        );
        assert_eq!(
            parse_std("setOpmode"),
            Err(CodecError::MissingArgument {
                command: "setOpmode",
                field: "mode"
            })
        );
        assert_eq!(
            parse_std("setOpmode 1 2"),
            Err(CodecError::UnexpectedArgument {
                command: "setOpmode",
                token: "2".into()
            })
        );
        assert!(matches!(
            parse_std("setOpmode 300"),
            Err(CodecError::InvalidValue { field: "mode", .. })
        ));
        assert_eq!(
            parse_std("setOpmode \"1\""),
            Err(CodecError::ExpectedScalar { field: "mode" })
        );
        assert_eq!(
            parse_std("setAttitudeTarget 1 0.1"),
            Err(CodecError::ExpectedArray {
                field: "quaternion"
            })
        );
        assert_eq!(
            parse_std("setAttitudeTarget \"1 0 0\" 0.1"),
            Err(CodecError::ArrayLength {
                field: "quaternion",
                expected: 4,
                got: 3
            })
        );
        assert_eq!(
            parse_std("setAttitudeTarget \"1 0 0 0 0.1"),
            Err(CodecError::UnterminatedQuote)
        );
        assert_eq!(
            parse_std("setOpmode 1\""),
            Err(CodecError::UnexpectedQuote("1\"".into()))
        );
    }

    #[test]
    fn keywords_are_case_sensitive() {
        assert!(matches!(
            parse_std("SETOPMODE 1"),
            Err(CodecError::UnknownKeyword(_))
        ));
    }

    #[test]
    fn split_keyword_keeps_remainder() {
        assert_eq!(split_keyword(" help  me "), Some(("help", " me")));
        assert_eq!(split_keyword("help"), Some(("help", "")));
        assert_eq!(split_keyword("  "), None);
    }
}
