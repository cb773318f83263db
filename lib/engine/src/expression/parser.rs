//! Recursive-descent parser producing the restricted expression AST.
//!
//! Precedence, loosest first: ternary, `??`, `||`, `&&`, equality,
//! relational, additive, multiplicative, unary, postfix
//! (member/index/call), primary.

use super::ExpressionError;
use super::lexer::Token;
use serde_json::Value as JsonValue;

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal value.
    Literal(JsonValue),
    /// An identifier, resolved against the host scope at eval time.
    Ident(String),
    /// `object.name` / `object?.name`.
    Member {
        object: Box<Expr>,
        name: String,
        optional: bool,
    },
    /// `object[index]` / `object?.[index]`.
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        optional: bool,
    },
    /// `callee(args…)`; callee is always a member access onto an
    /// enumerated host method.
    Call { callee: Box<Expr>, args: Vec<Expr> },
    /// `!expr` / `-expr`.
    Unary { op: UnaryOp, expr: Box<Expr> },
    /// Binary operation.
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `cond ? then : otherwise`.
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    NullishCoalesce,
}

/// Parses a token stream into an expression.
///
/// # Errors
///
/// Returns an error for malformed expressions or trailing tokens.
pub fn parse(tokens: &[Token]) -> Result<Expr, ExpressionError> {
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.ternary()?;
    if parser.pos != tokens.len() {
        return Err(ExpressionError::Parse {
            message: format!("unexpected trailing token: {:?}", tokens[parser.pos]),
        });
    }
    Ok(expr)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExpressionError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(ExpressionError::Parse {
                message: format!("expected {expected:?}, found {:?}", self.peek()),
            })
        }
    }

    fn ternary(&mut self) -> Result<Expr, ExpressionError> {
        let cond = self.nullish()?;
        if self.eat(&Token::Question) {
            let then = self.ternary()?;
            self.expect(&Token::Colon)?;
            let otherwise = self.ternary()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(cond)
    }

    fn nullish(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.logical_or()?;
        while self.eat(&Token::NullishCoalesce) {
            let rhs = self.logical_or()?;
            lhs = Expr::Binary {
                op: BinaryOp::NullishCoalesce,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn logical_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.logical_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.logical_and()?;
            lhs = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn logical_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.equality()?;
        while self.eat(&Token::And) {
            let rhs = self.equality()?;
            lhs = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::NotEq,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.relational()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn relational(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::LtEq) => BinaryOp::LtEq,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::GtEq) => BinaryOp::GtEq,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Not) {
            let expr = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        if self.eat(&Token::Minus) {
            let expr = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) | Some(Token::OptionalDot) => {
                    let optional = self.peek() == Some(&Token::OptionalDot);
                    self.pos += 1;
                    // `?.[index]` chains through to an optional index.
                    if optional && self.eat(&Token::LBracket) {
                        let index = self.ternary()?;
                        self.expect(&Token::RBracket)?;
                        expr = Expr::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                            optional: true,
                        };
                        continue;
                    }
                    let name = match self.advance() {
                        Some(Token::Ident(name)) => name.clone(),
                        other => {
                            return Err(ExpressionError::Parse {
                                message: format!("expected member name, found {other:?}"),
                            });
                        }
                    };
                    expr = Expr::Member {
                        object: Box::new(expr),
                        name,
                        optional,
                    };
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.ternary()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        optional: false,
                    };
                }
                Some(Token::LParen) => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.ternary()?);
                            if self.eat(&Token::Comma) {
                                continue;
                            }
                            self.expect(&Token::RParen)?;
                            break;
                        }
                    }
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance().cloned() {
            Some(Token::Number(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map_or(JsonValue::Null, JsonValue::Number),
            )),
            Some(Token::String(s)) => Ok(Expr::Literal(JsonValue::String(s))),
            Some(Token::Bool(b)) => Ok(Expr::Literal(JsonValue::Bool(b))),
            Some(Token::Null) => Ok(Expr::Literal(JsonValue::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let expr = self.ternary()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            other => Err(ExpressionError::Parse {
                message: format!("unexpected token: {other:?}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn parse_text(text: &str) -> Expr {
        parse(&tokenize(text).expect("tokenize")).expect("parse")
    }

    #[test]
    fn parses_chained_member_access() {
        let expr = parse_text("$json.a.b");
        let Expr::Member { object, name, .. } = expr else {
            panic!("expected member");
        };
        assert_eq!(name, "b");
        assert!(matches!(*object, Expr::Member { .. }));
    }

    #[test]
    fn parses_optional_chain() {
        let expr = parse_text("$json.a?.b");
        let Expr::Member { optional, .. } = expr else {
            panic!("expected member");
        };
        assert!(optional);
    }

    #[test]
    fn parses_node_index_access() {
        let expr = parse_text("$node[\"Input\"].json");
        let Expr::Member { object, name, .. } = expr else {
            panic!("expected member");
        };
        assert_eq!(name, "json");
        assert!(matches!(*object, Expr::Index { .. }));
    }

    #[test]
    fn nullish_binds_looser_than_member() {
        let expr = parse_text("$json.a ?? 'default'");
        assert!(matches!(
            expr,
            Expr::Binary {
                op: BinaryOp::NullishCoalesce,
                ..
            }
        ));
    }

    #[test]
    fn parses_call_with_args() {
        let expr = parse_text("$json.name.slice(0, 3)");
        let Expr::Call { args, .. } = expr else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn parses_ternary() {
        let expr = parse_text("$json.ok ? 1 : 2");
        assert!(matches!(expr, Expr::Ternary { .. }));
    }

    #[test]
    fn arithmetic_precedence() {
        let expr = parse_text("1 + 2 * 3");
        let Expr::Binary {
            op: BinaryOp::Add,
            rhs,
            ..
        } = expr
        else {
            panic!("expected addition at the root");
        };
        assert!(matches!(
            *rhs,
            Expr::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn rejects_trailing_tokens() {
        let tokens = tokenize("1 2").expect("tokenize");
        assert!(parse(&tokens).is_err());
    }
}
