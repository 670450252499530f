use std::net::IpAddr;

use log::trace;

use super::expression::{Filter, SetMode};
use crate::error_handling::types::FilterError;

const SEPARATORS: [char; 3] = [',', '(', ')'];

/// Largest port set the binary form can count.
pub const MAX_PORTS: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy)]
enum Kind {
    Const(bool),
    Not,
    And,
    Or,
    Addresses(SetMode),
    Ports(SetMode),
}

fn kind_of(code: char) -> Result<Kind, FilterError> {
    Ok(match code {
        'T' => Kind::Const(true),
        'F' => Kind::Const(false),
        '!' => Kind::Not,
        '&' => Kind::And,
        '|' => Kind::Or,
        'i' => Kind::Addresses(SetMode::Deny),
        'I' => Kind::Addresses(SetMode::Allow),
        'p' => Kind::Ports(SetMode::Deny),
        'P' => Kind::Ports(SetMode::Allow),
        other => return Err(FilterError::UnknownCode(other.to_string())),
    })
}

fn single_code(token: &str) -> Result<char, FilterError> {
    let mut chars = token.chars();
    match (chars.next(), chars.next()) {
        (Some(code), None) => Ok(code),
        _ => Err(FilterError::UnknownCode(token.to_string())),
    }
}

/// Parses the textual filter language.
///
/// ```text
/// expr  := CODE | CODE '(' items ')'
/// items := (expr | value) (',' (expr | value))*
/// ```
///
/// Whitespace around tokens is ignored.
pub fn parse(text: &str) -> Result<Filter, FilterError> {
    let text = text.trim();
    let mut chars = text.chars();
    let code = chars.next().ok_or(FilterError::Empty)?;
    let kind = kind_of(code)?;
    let rest = chars.as_str().trim_start();

    let mut parser = Parser { rest };
    let filter = match rest.strip_prefix('(') {
        Some(arguments) => {
            parser.rest = arguments;
            parser.with_arguments(kind, code)?
        }
        None => parser.without_arguments(kind)?,
    };

    let trailing = parser.rest.trim();
    if !trailing.is_empty() {
        return Err(FilterError::Trailing(trailing.to_string()));
    }
    Ok(filter)
}

struct Parser<'a> {
    rest: &'a str,
}

impl<'a> Parser<'a> {
    /// Leading text (trimmed) up to the next separator, and the separator.
    fn next_token(&mut self) -> Result<(&'a str, char), FilterError> {
        let rest = self.rest;
        let at = rest.find(SEPARATORS).ok_or(FilterError::Unterminated)?;
        let token = rest[..at].trim();
        // Separators are all ASCII.
        let separator = char::from(rest.as_bytes()[at]);
        self.rest = &rest[at + 1..];
        trace!("filter token {token:?} before {separator:?}");
        Ok((token, separator))
    }

    fn without_arguments(&mut self, kind: Kind) -> Result<Filter, FilterError> {
        Ok(match kind {
            Kind::Const(true) => Filter::True,
            Kind::Const(false) => Filter::False,
            Kind::Not => return Err(FilterError::NotArity(0)),
            Kind::And => Filter::And(Vec::new()),
            Kind::Or => Filter::Or(Vec::new()),
            Kind::Addresses(mode) => Filter::IpSet {
                mode,
                addresses: Vec::new(),
            },
            Kind::Ports(mode) => Filter::PortSet {
                mode,
                ports: Vec::new(),
            },
        })
    }

    /// Called right after the opening parenthesis; consumes up to and
    /// including the matching closing one.
    fn with_arguments(&mut self, kind: Kind, code: char) -> Result<Filter, FilterError> {
        Ok(match kind {
            Kind::Const(_) => return Err(FilterError::UnexpectedArguments(code)),
            Kind::Not => {
                let mut children = self.children()?;
                if children.len() != 1 {
                    return Err(FilterError::NotArity(children.len()));
                }
                Filter::Not(Box::new(children.remove(0)))
            }
            Kind::And => Filter::And(self.children()?),
            Kind::Or => Filter::Or(self.children()?),
            Kind::Addresses(mode) => {
                let addresses = self
                    .values()?
                    .into_iter()
                    .map(|value| {
                        value
                            .parse::<IpAddr>()
                            .map_err(|_| FilterError::InvalidAddress(value.to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Filter::IpSet { mode, addresses }
            }
            Kind::Ports(mode) => {
                let ports = self
                    .values()?
                    .into_iter()
                    .map(|value| {
                        value
                            .parse::<u16>()
                            .map_err(|_| FilterError::InvalidPort(value.to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                if ports.len() > MAX_PORTS {
                    return Err(FilterError::TooManyPorts(ports.len()));
                }
                Filter::PortSet { mode, ports }
            }
        })
    }

    fn children(&mut self) -> Result<Vec<Filter>, FilterError> {
        let mut children = Vec::new();
        // Set once a child consumed its own argument list; the next token must
        // then be a bare separator.
        let mut after_list = false;
        loop {
            let (token, separator) = self.next_token()?;
            if token.is_empty() {
                match separator {
                    ')' => return Ok(children),
                    ',' => {
                        after_list = false;
                        continue;
                    }
                    _ => return Err(FilterError::UnexpectedParen),
                }
            }
            if after_list {
                return Err(FilterError::Trailing(token.to_string()));
            }

            let code = single_code(token)?;
            let kind = kind_of(code)?;
            if separator == '(' {
                children.push(self.with_arguments(kind, code)?);
                after_list = true;
            } else {
                children.push(self.without_arguments(kind)?);
                if separator == ')' {
                    return Ok(children);
                }
            }
        }
    }

    fn values(&mut self) -> Result<Vec<&'a str>, FilterError> {
        let mut values = Vec::new();
        loop {
            let (token, separator) = self.next_token()?;
            if !token.is_empty() {
                values.push(token);
            }
            match separator {
                ')' => return Ok(values),
                ',' => {}
                _ => return Err(FilterError::UnexpectedParen),
            }
        }
    }
}
