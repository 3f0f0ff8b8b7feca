//! Query text parsing.
//!
//! The translator only depends on the [`ExpressionParser`] trait. [`CqlParser`]
//! implements the subset of CQL the federation layer needs:
//!
//! | Construct | Example |
//! |-----------|---------|
//! | Unqualified term | `fiets`, `"harry potter"` |
//! | Qualified clause | `country=NL`, `title exact "De Hobbit"` |
//! | Boolean operators | `a AND b`, `a OR b`, `a NOT b` |
//! | Grouping | `(a OR b) AND c` |
//!
//! Boolean operators have equal precedence and associate to the left, as in CQL.

use crate::error::{RequestError, RequestResult};
use crate::expression::{QueryExpression, SearchClause};

/// Turns query text into a [`QueryExpression`].
pub trait ExpressionParser: Send + Sync {
    /// Parses `text`, failing with [`RequestError::QueryParse`].
    fn parse(&self, text: &str) -> RequestResult<QueryExpression>;
}

/// Parser for a CQL subset.
#[derive(Debug, Clone, Copy, Default)]
pub struct CqlParser;

impl CqlParser {
    /// Creates a new parser.
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionParser for CqlParser {
    fn parse(&self, text: &str) -> RequestResult<QueryExpression> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(parse_error("empty query"));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_query()?;
        if let Some(token) = parser.peek() {
            return Err(parse_error(format!("unexpected token {:?}", token)));
        }
        Ok(expr)
    }
}

const RELATION_WORDS: &[&str] = &["exact", "any", "all", "adj"];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Relation(String),
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Boolean {
    And,
    Or,
    Not,
}

fn parse_error(message: impl Into<String>) -> RequestError {
    RequestError::QueryParse {
        message: message.into(),
    }
}

fn tokenize(text: &str) -> RequestResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(parse_error("unterminated quoted string"));
                }
                tokens.push(Token::Quoted(value));
            }
            '=' | '<' | '>' => {
                let mut relation = String::new();
                relation.push(c);
                chars.next();
                if let Some(&next) = chars.peek() {
                    let pair = matches!((c, next), ('=', '=') | ('<', '>') | ('<', '=') | ('>', '='));
                    if pair {
                        relation.push(next);
                        chars.next();
                    }
                }
                tokens.push(Token::Relation(relation));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '(' | ')' | '"' | '=' | '<' | '>') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_boolean(&self) -> Option<Boolean> {
        match self.peek() {
            Some(Token::Word(word)) => match word.to_ascii_uppercase().as_str() {
                "AND" => Some(Boolean::And),
                "OR" => Some(Boolean::Or),
                "NOT" => Some(Boolean::Not),
                _ => None,
            },
            _ => None,
        }
    }

    fn parse_query(&mut self) -> RequestResult<QueryExpression> {
        let mut left = self.parse_primary()?;
        while let Some(op) = self.peek_boolean() {
            self.next();
            let right = self.parse_primary()?;
            let combined = match op {
                Boolean::And => QueryExpression::and_all([left, right]),
                Boolean::Or => QueryExpression::or_all([left, right]),
                Boolean::Not => {
                    QueryExpression::and_all([left, QueryExpression::Not(Box::new(right))])
                }
            };
            left = combined.ok_or_else(|| parse_error("empty boolean expression"))?;
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> RequestResult<QueryExpression> {
        match self.peek() {
            Some(Token::LParen) => {
                self.next();
                let inner = self.parse_query()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(parse_error("missing closing parenthesis")),
                }
            }
            Some(Token::Word(_)) | Some(Token::Quoted(_)) => self.parse_clause(),
            Some(token) => Err(parse_error(format!("unexpected token {:?}", token))),
            None => Err(parse_error("unexpected end of query")),
        }
    }

    fn relation_at(&self, offset: usize) -> Option<String> {
        match self.peek_at(offset) {
            Some(Token::Relation(relation)) => Some(relation.clone()),
            Some(Token::Word(word)) if RELATION_WORDS.contains(&word.to_ascii_lowercase().as_str()) => {
                // a relation word only counts when a term follows it
                match self.peek_at(offset + 1) {
                    Some(Token::Word(_)) | Some(Token::Quoted(_)) => Some(word.to_ascii_lowercase()),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn parse_clause(&mut self) -> RequestResult<QueryExpression> {
        let first = match self.next() {
            Some(Token::Word(word)) | Some(Token::Quoted(word)) => word,
            _ => return Err(parse_error("expected search term")),
        };

        let Some(relation) = self.relation_at(0) else {
            return Ok(QueryExpression::Term(SearchClause::term(first)));
        };
        self.next();

        let term = match self.next() {
            Some(Token::Word(word)) | Some(Token::Quoted(word)) => word,
            _ => return Err(parse_error(format!("missing term after '{}{}'", first, relation))),
        };
        Ok(QueryExpression::Term(SearchClause::new(first, relation, term)))
    }
}
