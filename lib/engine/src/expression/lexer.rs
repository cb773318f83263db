//! Tokenizer for the expression language.

use super::ExpressionError;

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Numeric literal.
    Number(f64),
    /// String literal (single or double quoted).
    String(String),
    /// Identifier, including `$`-prefixed host names.
    Ident(String),
    /// `true` / `false`.
    Bool(bool),
    /// `null`.
    Null,
    Dot,
    /// `?.`
    OptionalDot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    /// `==` or `===`.
    Eq,
    /// `!=` or `!==`.
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    /// `??`
    NullishCoalesce,
    Not,
    Question,
    Colon,
}

/// Tokenizes an expression string.
///
/// # Errors
///
/// Returns an error for unterminated strings or unexpected characters.
pub fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        match c {
            ' ' | '\t' | '\n' | '\r' => pos += 1,
            '0'..='9' => {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                    // Don't swallow a method call after a bare integer.
                    if chars[pos] == '.'
                        && chars
                            .get(pos + 1)
                            .is_none_or(|next| !next.is_ascii_digit())
                    {
                        break;
                    }
                    pos += 1;
                }
                let text: String = chars[start..pos].iter().collect();
                let number = text.parse::<f64>().map_err(|_| ExpressionError::Lex {
                    position: start,
                    message: format!("invalid number literal '{text}'"),
                })?;
                tokens.push(Token::Number(number));
            }
            '"' | '\'' => {
                let quote = c;
                pos += 1;
                let mut text = String::new();
                loop {
                    match chars.get(pos) {
                        None => {
                            return Err(ExpressionError::Lex {
                                position: pos,
                                message: "unterminated string literal".to_string(),
                            });
                        }
                        Some(&ch) if ch == quote => {
                            pos += 1;
                            break;
                        }
                        Some('\\') => {
                            pos += 1;
                            let escaped = chars.get(pos).copied().ok_or(ExpressionError::Lex {
                                position: pos,
                                message: "unterminated escape sequence".to_string(),
                            })?;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => other,
                            });
                            pos += 1;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            pos += 1;
                        }
                    }
                }
                tokens.push(Token::String(text));
            }
            'a'..='z' | 'A'..='Z' | '_' | '$' => {
                let start = pos;
                pos += 1;
                while pos < chars.len()
                    && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '_')
                {
                    pos += 1;
                }
                let text: String = chars[start..pos].iter().collect();
                tokens.push(match text.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    _ => Token::Ident(text),
                });
            }
            '.' => {
                tokens.push(Token::Dot);
                pos += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                pos += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                pos += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                pos += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                pos += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                pos += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                pos += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                pos += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                pos += 1;
            }
            '?' => match chars.get(pos + 1) {
                Some('.') => {
                    tokens.push(Token::OptionalDot);
                    pos += 2;
                }
                Some('?') => {
                    tokens.push(Token::NullishCoalesce);
                    pos += 2;
                }
                _ => {
                    tokens.push(Token::Question);
                    pos += 1;
                }
            },
            '=' => {
                // Accept both == and ===.
                if chars.get(pos + 1) == Some(&'=') {
                    pos += if chars.get(pos + 2) == Some(&'=') { 3 } else { 2 };
                    tokens.push(Token::Eq);
                } else {
                    return Err(ExpressionError::Lex {
                        position: pos,
                        message: "unexpected '='; assignment is not supported".to_string(),
                    });
                }
            }
            '!' => {
                if chars.get(pos + 1) == Some(&'=') {
                    pos += if chars.get(pos + 2) == Some(&'=') { 3 } else { 2 };
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Not);
                    pos += 1;
                }
            }
            '<' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::LtEq);
                    pos += 2;
                } else {
                    tokens.push(Token::Lt);
                    pos += 1;
                }
            }
            '>' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::GtEq);
                    pos += 2;
                } else {
                    tokens.push(Token::Gt);
                    pos += 1;
                }
            }
            '&' => {
                if chars.get(pos + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    pos += 2;
                } else {
                    return Err(ExpressionError::Lex {
                        position: pos,
                        message: "unexpected '&'".to_string(),
                    });
                }
            }
            '|' => {
                if chars.get(pos + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    pos += 2;
                } else {
                    return Err(ExpressionError::Lex {
                        position: pos,
                        message: "unexpected '|'".to_string(),
                    });
                }
            }
            other => {
                return Err(ExpressionError::Lex {
                    position: pos,
                    message: format!("unexpected character '{other}'"),
                });
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_member_access() {
        let tokens = tokenize("$json.field").expect("tokenize");
        assert_eq!(
            tokens,
            vec![
                Token::Ident("$json".to_string()),
                Token::Dot,
                Token::Ident("field".to_string()),
            ]
        );
    }

    #[test]
    fn tokenizes_optional_chain_and_nullish() {
        let tokens = tokenize("$json.a?.b ?? 'x'").expect("tokenize");
        assert!(tokens.contains(&Token::OptionalDot));
        assert!(tokens.contains(&Token::NullishCoalesce));
        assert!(tokens.contains(&Token::String("x".to_string())));
    }

    #[test]
    fn tokenizes_numbers_without_eating_method_dots() {
        let tokens = tokenize("1.5 + 2.toFixed(1)").expect("tokenize");
        assert_eq!(tokens[0], Token::Number(1.5));
        assert_eq!(tokens[2], Token::Number(2.0));
        assert_eq!(tokens[3], Token::Dot);
    }

    #[test]
    fn double_and_triple_equals_collapse() {
        assert_eq!(tokenize("a == b").unwrap()[1], Token::Eq);
        assert_eq!(tokenize("a === b").unwrap()[1], Token::Eq);
        assert_eq!(tokenize("a !== b").unwrap()[1], Token::NotEq);
    }

    #[test]
    fn string_escapes() {
        let tokens = tokenize(r#""a\nb""#).expect("tokenize");
        assert_eq!(tokens[0], Token::String("a\nb".to_string()));
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(matches!(
            tokenize("'abc"),
            Err(ExpressionError::Lex { .. })
        ));
    }

    #[test]
    fn rejects_assignment() {
        assert!(tokenize("a = b").is_err());
    }
}
