//! Synth script syntax.
//!
//! A script is a list of functions. Function bodies hold `let` bindings,
//! `return` statements and bare expressions; expressions are numbers,
//! strings, identifiers, lists, member access and calls with positional
//! or `name: value` arguments. `//` starts a comment.
//!
//! ```text
//! async fn create_synth(tone, volume) {
//!     let synth = tone.PolySynth(tone.FMSynth, attack: 0.05)
//!     tone.connect_series(synth, tone.Reverb(decay: 3), volume)
//!     return synth
//! }
//! ```

use std::fmt;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace1},
    combinator::{cut, map, map_res, opt, recognize, value, verify},
    error::{Error, ErrorKind},
    multi::{many0, many0_count, separated_list0},
    sequence::{delimited, pair, preceded, separated_pair, terminated, tuple},
    IResult,
};

const RESERVED: [&str; 4] = ["fn", "async", "let", "return"];

/// Deepest bracket nesting, and longest chain of `.member` and `(..)`
/// suffixes, a script may use.
pub const MAX_NESTING: usize = 64;

const TOO_DEEP: &str = "expression nested too deeply";

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Ident(String),
    List(Vec<Expr>),
    /// `target.name`
    Member { target: Box<Expr>, name: String },
    /// `callee(args)`
    Call { callee: Box<Expr>, args: Vec<Arg> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    /// Set for `name: value` arguments.
    pub name: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let { name: String, value: Expr },
    Return(Vec<Expr>),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub is_async: bool,
    /// 1-based line of the `fn` keyword.
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Script {
    pub functions: Vec<Function>,
}

impl Script {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// A syntax error with a 1-based position.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl ParseError {
    fn at(source: &str, remaining: &str, message: impl Into<String>) -> Self {
        let offset = source.len() - remaining.len();
        let (line, column) = position(source, offset);
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

impl std::error::Error for ParseError {}

fn position(source: &str, offset: usize) -> (usize, usize) {
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
    (line, column)
}

/// Parses a whole script.
pub fn parse(source: &str) -> Result<Script, ParseError> {
    check_nesting(source)?;

    let mut script = Script::default();
    let mut rest = source;

    loop {
        let (next, _) = ws(rest).map_err(|e| syntax_error(source, e))?;
        if next.is_empty() {
            break;
        }

        let (line, _) = position(source, source.len() - next.len());
        let (next, mut function) = function(next).map_err(|e| syntax_error(source, e))?;
        if script.function(&function.name).is_some() {
            return Err(ParseError {
                line,
                column: 1,
                message: format!("function `{}` is defined twice", function.name),
            });
        }
        function.line = line;
        script.functions.push(function);
        rest = next;
    }

    Ok(script)
}

/// Rejects bracket nesting deeper than [`MAX_NESTING`] before the
/// recursive parser sees it.
fn check_nesting(source: &str) -> Result<(), ParseError> {
    let mut depth = 0usize;
    let mut quote = None;
    let mut comment = false;
    let mut chars = source.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if comment {
            comment = c != '\n';
            continue;
        }
        if let Some(q) = quote {
            if c == q || c == '\n' {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '/' if matches!(chars.peek(), Some((_, '/'))) => comment = true,
            '(' | '[' => {
                depth += 1;
                if depth > MAX_NESTING {
                    return Err(ParseError::at(source, &source[i..], TOO_DEEP));
                }
            }
            ')' | ']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

fn syntax_error(source: &str, err: nom::Err<Error<&str>>) -> ParseError {
    if let nom::Err::Failure(e) = &err {
        if e.code == ErrorKind::TooLarge {
            return ParseError::at(source, e.input.trim_start(), TOO_DEEP);
        }
    }

    let remaining = match &err {
        nom::Err::Error(e) | nom::Err::Failure(e) => e.input,
        nom::Err::Incomplete(_) => "",
    };
    let remaining = remaining.trim_start();
    if remaining.is_empty() {
        return ParseError::at(source, remaining, "unexpected end of script");
    }

    let token: String = remaining
        .chars()
        .take_while(|c| !c.is_whitespace())
        .take(16)
        .collect();
    ParseError::at(source, remaining, format!("unexpected `{}`", token))
}

/// Whitespace and `//` comments.
fn ws(input: &str) -> IResult<&str, ()> {
    value(
        (),
        many0_count(alt((
            value((), multispace1),
            value((), pair(tag("//"), take_while(|c| c != '\n'))),
        ))),
    )(input)
}

fn token<'a, O, F>(parser: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    preceded(ws, parser)
}

fn raw_identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0_count(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn identifier(input: &str) -> IResult<&str, String> {
    map(
        verify(raw_identifier, |s: &str| !RESERVED.contains(&s)),
        str::to_string,
    )(input)
}

fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    verify(raw_identifier, move |s: &str| s == kw)
}

fn number(input: &str) -> IResult<&str, f64> {
    map_res(
        recognize(tuple((
            opt(char('-')),
            digit1,
            opt(pair(char('.'), digit1)),
        ))),
        str::parse::<f64>,
    )(input)
}

fn string(input: &str) -> IResult<&str, String> {
    map(
        alt((
            delimited(char('"'), take_while(|c| c != '"' && c != '\n'), char('"')),
            delimited(char('\''), take_while(|c| c != '\'' && c != '\n'), char('\'')),
        )),
        str::to_string,
    )(input)
}

fn list(input: &str) -> IResult<&str, Vec<Expr>> {
    delimited(
        char('['),
        terminated(
            separated_list0(token(char(',')), expr),
            opt(token(char(','))),
        ),
        cut(token(char(']'))),
    )(input)
}

fn primary(input: &str) -> IResult<&str, Expr> {
    token(alt((
        map(number, Expr::Number),
        map(string, Expr::Str),
        map(list, Expr::List),
        map(identifier, Expr::Ident),
    )))(input)
}

fn argument(input: &str) -> IResult<&str, Arg> {
    alt((
        map(
            separated_pair(token(identifier), token(char(':')), cut(expr)),
            |(name, value)| Arg {
                name: Some(name),
                value,
            },
        ),
        map(expr, |value| Arg { name: None, value }),
    ))(input)
}

fn arguments(input: &str) -> IResult<&str, Vec<Arg>> {
    delimited(
        token(char('(')),
        terminated(
            separated_list0(token(char(',')), argument),
            opt(token(char(','))),
        ),
        cut(token(char(')'))),
    )(input)
}

enum Postfix {
    Member(String),
    Call(Vec<Arg>),
}

fn expr(input: &str) -> IResult<&str, Expr> {
    let start = input;
    let (input, first) = primary(input)?;
    let (input, postfixes) = many0(alt((
        map(
            preceded(token(char('.')), cut(token(raw_identifier))),
            |name: &str| Postfix::Member(name.to_string()),
        ),
        map(arguments, Postfix::Call),
    )))(input)?;
    if postfixes.len() > MAX_NESTING {
        return Err(nom::Err::Failure(Error::new(start, ErrorKind::TooLarge)));
    }

    let expr = postfixes.into_iter().fold(first, |target, postfix| match postfix {
        Postfix::Member(name) => Expr::Member {
            target: Box::new(target),
            name,
        },
        Postfix::Call(args) => Expr::Call {
            callee: Box::new(target),
            args,
        },
    });
    Ok((input, expr))
}

fn statement(input: &str) -> IResult<&str, Stmt> {
    terminated(
        alt((
            map(
                preceded(
                    token(keyword("let")),
                    cut(separated_pair(token(identifier), token(char('=')), expr)),
                ),
                |(name, value)| Stmt::Let { name, value },
            ),
            map(
                preceded(
                    token(keyword("return")),
                    separated_list0(token(char(',')), expr),
                ),
                Stmt::Return,
            ),
            map(expr, Stmt::Expr),
        )),
        opt(token(char(';'))),
    )(input)
}

fn function(input: &str) -> IResult<&str, Function> {
    let (input, is_async) = map(opt(token(keyword("async"))), |a| a.is_some())(input)?;
    let (input, _) = token(keyword("fn"))(input)?;
    let (input, (name, params, body)) = cut(tuple((
        token(identifier),
        delimited(
            token(char('(')),
            terminated(
                separated_list0(token(char(',')), token(identifier)),
                opt(token(char(','))),
            ),
            token(char(')')),
        ),
        delimited(token(char('{')), many0(statement), token(char('}'))),
    )))(input)?;

    Ok((
        input,
        Function {
            name,
            params,
            body,
            is_async,
            line: 0,
        },
    ))
}
