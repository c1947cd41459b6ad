//! # FHIRPath Expression Parser
//!
//! Turns FHIRPath text into an [`Expression`] tree. Parsing is purely syntactic:
//! the grammar accepted here is the full FHIRPath grammar, which is deliberately
//! wider than what [`crate::evaluator`] can compile. Constructs such as indexers,
//! unions or type tests parse successfully and are rejected at evaluation time.
//!
//! ## Operator precedence (tightest first)
//!
//! 1. Postfix: member access and invocation (`.`), indexing (`[]`)
//! 2. Prefix polarity (`+`, `-`)
//! 3. `*`, `/`, `div`, `mod`
//! 4. `+`, `-`, `&`
//! 5. `|`
//! 6. `<`, `<=`, `>`, `>=`
//! 7. `is`, `as`
//! 8. `=`, `~`, `!=`, `!~`
//! 9. `in`, `contains`
//! 10. `and`
//! 11. `or`, `xor`
//! 12. `implies`
//!
//! Single-line (`//`) and block (`/* */`) comments are treated as whitespace.
//!
//! ## Examples
//!
//! ```rust
//! use atrius_fhir_path::parser::{Expression, parse_expression};
//!
//! let expr = parse_expression("Observation.code.memberOf('http://example.org/vs')").unwrap();
//! assert!(matches!(expr, Expression::Invocation(..)));
//! assert_eq!(expr.to_string(), "Observation.code.memberOf('http://example.org/vs')");
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use chumsky::Parser;
use chumsky::error::Rich;
use chumsky::prelude::*;
use rust_decimal::Decimal;

use atrius_fhirpath_support::evaluation_error::{EvaluationError, EvaluationResult};

/// A literal value.
///
/// Dates, date-times and times keep their source text (without the leading `@`)
/// so that partial precision survives, e.g. `@2024-03` stays `2024-03`.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// `{}`
    Null,
    Boolean(bool),
    String(String),
    /// A number with a decimal point.
    Number(Decimal),
    Integer(i64),
    Date(String),
    DateTime(String),
    Time(String),
    /// A number followed by a unit, e.g. `5 'mg'` or `3 days`.
    Quantity(Decimal, String),
}

/// A FHIRPath expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Term(Term),
    /// `left.invocation`
    Invocation(Box<Expression>, Invocation),
    /// `left[index]`
    Indexer(Box<Expression>, Box<Expression>),
    /// Unary `+` or `-`.
    Polarity(char, Box<Expression>),
    Multiplicative(Box<Expression>, String, Box<Expression>),
    Additive(Box<Expression>, String, Box<Expression>),
    /// `is` / `as`
    Type(Box<Expression>, String, TypeSpecifier),
    Union(Box<Expression>, Box<Expression>),
    Inequality(Box<Expression>, String, Box<Expression>),
    Equality(Box<Expression>, String, Box<Expression>),
    /// `in` / `contains`
    Membership(Box<Expression>, String, Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    /// `or` / `xor`
    Or(Box<Expression>, String, Box<Expression>),
    Implies(Box<Expression>, Box<Expression>),
}

/// A possibly namespace-qualified type name, e.g. `FHIR.Patient` or `Boolean`.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSpecifier {
    /// `(namespace, Some(name))` when qualified, `(name, None)` otherwise.
    QualifiedIdentifier(String, Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Invocation(Invocation),
    Literal(Literal),
    /// `%name` or `%'name'`
    ExternalConstant(String),
    Parenthesized(Box<Expression>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Member(String),
    Function(String, Vec<Expression>),
    This,
    Index,
    Total,
}

impl Expression {
    /// The operator token of a binary node, with its operands.
    pub fn as_binary(&self) -> Option<(&Expression, &str, &Expression)> {
        match self {
            Expression::Multiplicative(l, op, r)
            | Expression::Additive(l, op, r)
            | Expression::Inequality(l, op, r)
            | Expression::Equality(l, op, r)
            | Expression::Membership(l, op, r)
            | Expression::Or(l, op, r) => Some((l, op.as_str(), r)),
            Expression::And(l, r) => Some((l, "and", r)),
            Expression::Implies(l, r) => Some((l, "implies", r)),
            _ => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "{{}}"),
            Literal::Boolean(b) => write!(f, "{}", b),
            Literal::String(s) => write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Literal::Number(d) => write!(f, "{}", d),
            Literal::Integer(n) => write!(f, "{}", n),
            Literal::Date(d) => write!(f, "@{}", d),
            Literal::DateTime(dt) => write!(f, "@{}", dt),
            Literal::Time(t) => write!(f, "@T{}", t),
            Literal::Quantity(d, unit) => write!(f, "{} '{}'", d, unit),
        }
    }
}

impl fmt::Display for TypeSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSpecifier::QualifiedIdentifier(namespace, Some(name)) => {
                write!(f, "{}.{}", namespace, name)
            }
            TypeSpecifier::QualifiedIdentifier(name, None) => write!(f, "{}", name),
        }
    }
}

fn write_arguments(f: &mut fmt::Formatter<'_>, args: &[Expression]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", arg)?;
    }
    Ok(())
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocation::Member(name) => write!(f, "{}", name),
            Invocation::Function(name, args) => {
                write!(f, "{}(", name)?;
                write_arguments(f, args)?;
                write!(f, ")")
            }
            Invocation::This => write!(f, "$this"),
            Invocation::Index => write!(f, "$index"),
            Invocation::Total => write!(f, "$total"),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Invocation(invocation) => write!(f, "{}", invocation),
            Term::Literal(literal) => write!(f, "{}", literal),
            Term::ExternalConstant(name) => write!(f, "%{}", name),
            Term::Parenthesized(inner) => write!(f, "({})", inner),
        }
    }
}

/// Canonical text of an expression: single spaces around binary operators, no
/// comments, and `, ` between arguments.
impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some((left, op, right)) = self.as_binary() {
            return write!(f, "{} {} {}", left, op, right);
        }
        match self {
            Expression::Term(term) => write!(f, "{}", term),
            Expression::Invocation(left, invocation) => write!(f, "{}.{}", left, invocation),
            Expression::Indexer(left, index) => write!(f, "{}[{}]", left, index),
            Expression::Polarity(sign, operand) => write!(f, "{}{}", sign, operand),
            Expression::Type(left, op, type_specifier) => {
                write!(f, "{} {} {}", left, op, type_specifier)
            }
            Expression::Union(left, right) => write!(f, "{} | {}", left, right),
            _ => Ok(()),
        }
    }
}

/// Parses `text` into an [`Expression`], reporting syntax errors as
/// [`EvaluationError::Parse`].
pub fn parse_expression(text: &str) -> EvaluationResult<Expression> {
    parser().parse(text).into_result().map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        EvaluationError::Parse(format!("{}: {}", text, messages.join("; ")))
    })
}

type ParserError<'src> = extra::Err<Rich<'src, char>>;

/// Wraps `parser` so it skips surrounding whitespace and comments.
fn custom_padded<'src, T, P>(parser: P) -> impl Parser<'src, &'src str, T, ParserError<'src>> + Clone
where
    P: Parser<'src, &'src str, T, ParserError<'src>> + Clone,
    T: Clone,
{
    let trivia = choice((
        text::whitespace().at_least(1).ignored(),
        just("//")
            .then(any().and_is(text::newline().or(end()).not()).repeated())
            .ignored(),
        just("/*")
            .then(any().and_is(just("*/").not()).repeated())
            .then(just("*/"))
            .ignored(),
    ))
    .repeated()
    .ignored();

    trivia.clone().then(parser).map(|(_, out)| out).then_ignore(trivia)
}

/// Exactly `count` ASCII digits.
fn digits<'src>(count: usize) -> impl Parser<'src, &'src str, String, ParserError<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_ascii_digit())
        .repeated()
        .exactly(count)
        .collect::<String>()
}

/// One or more ASCII digits.
fn digit_run<'src>() -> impl Parser<'src, &'src str, String, ParserError<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_ascii_digit())
        .repeated()
        .at_least(1)
        .collect::<String>()
}

fn is_valid_date(text: &str) -> bool {
    let mut parts = text.split('-');
    let year = parts.next().and_then(|y| y.parse::<i32>().ok());
    let month = parts.next().map(|m| m.parse::<u32>().ok());
    let day = parts.next().map(|d| d.parse::<u32>().ok());
    match (year, month, day) {
        (Some(_), None, None) => true,
        (Some(_), Some(Some(month)), None) => (1..=12).contains(&month),
        (Some(year), Some(Some(month)), Some(Some(day))) => {
            NaiveDate::from_ymd_opt(year, month, day).is_some()
        }
        _ => false,
    }
}

fn is_valid_time(text: &str) -> bool {
    let (clock, fraction) = match text.split_once('.') {
        Some((clock, fraction)) => {
            let all_digits = !fraction.is_empty() && fraction.bytes().all(|b| b.is_ascii_digit());
            (clock, all_digits.then_some(0))
        }
        None => (text, Some(0)),
    };
    let fields: Vec<Option<u32>> = clock.split(':').map(|p| p.parse().ok()).collect();
    let field = |i: usize| fields.get(i).copied().unwrap_or(Some(0));
    match (field(0), field(1), field(2), fraction) {
        (Some(h), Some(m), Some(s), Some(_)) => NaiveTime::from_hms_opt(h, m, s).is_some(),
        _ => false,
    }
}

/// Builds the FHIRPath grammar.
pub fn parser<'src>() -> impl Parser<'src, &'src str, Expression, ParserError<'src>> + Clone + 'src {
    let escape = just('\\').ignore_then(choice((
        just('`').to('`'),
        just('\'').to('\''),
        just('\\').to('\\'),
        just('/').to('/'),
        just('f').to('\u{000C}'),
        just('n').to('\n'),
        just('r').to('\r'),
        just('t').to('\t'),
        just('"').to('"'),
        just('u').ignore_then(digits_hex().try_map(|hex: String, span| {
            u32::from_str_radix(&hex, 16)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| Rich::custom(span, format!("Invalid unicode escape: \\u{}", hex)))
        })),
    )));

    let quoted = just('\'')
        .ignore_then(none_of("\\'").or(escape.clone()).repeated().collect::<String>())
        .then_ignore(just('\''));

    // Literals

    let null = just('{').then(just('}')).to(Literal::Null);

    let boolean = choice((
        text::keyword("true").to(Literal::Boolean(true)),
        text::keyword("false").to(Literal::Boolean(false)),
    ))
    .boxed();

    let string = quoted.clone().map(Literal::String).boxed();

    let integer_value = digit_run().try_map(|text: String, span| {
        i64::from_str(&text).map_err(|_| Rich::custom(span, format!("Invalid integer: {}", text)))
    });

    let decimal_value = digit_run()
        .then_ignore(just('.'))
        .then(digit_run())
        .try_map(|(whole, fraction), span| {
            let text = format!("{}.{}", whole, fraction);
            Decimal::from_str(&text).map_err(|_| Rich::custom(span, format!("Invalid number: {}", text)))
        });

    let integer = custom_padded(integer_value.clone().map(Literal::Integer));
    let number = decimal_value.clone().map(Literal::Number).padded();

    let calendar_unit = choice((
        text::keyword("years").to("years"),
        text::keyword("year").to("year"),
        text::keyword("months").to("months"),
        text::keyword("month").to("month"),
        text::keyword("weeks").to("weeks"),
        text::keyword("week").to("week"),
        text::keyword("days").to("days"),
        text::keyword("day").to("day"),
        text::keyword("hours").to("hours"),
        text::keyword("hour").to("hour"),
        text::keyword("minutes").to("minutes"),
        text::keyword("minute").to("minute"),
        text::keyword("seconds").to("seconds"),
        text::keyword("second").to("second"),
        text::keyword("milliseconds").to("milliseconds"),
        text::keyword("millisecond").to("millisecond"),
    ))
    .map(str::to_string);

    let unit = choice((calendar_unit, quoted.clone())).boxed().padded();

    // A quantity needs whitespace between the number and its unit.
    let quantity = choice((
        decimal_value
            .clone()
            .then_ignore(text::whitespace().at_least(1))
            .then(unit.clone()),
        integer_value
            .clone()
            .map(Decimal::from)
            .then_ignore(text::whitespace().at_least(1))
            .then(unit.clone()),
    ))
    .map(|(value, unit)| Literal::Quantity(value, unit));

    let date_text = digits(4)
        .then(just('-').ignore_then(digits(2)).then(just('-').ignore_then(digits(2)).or_not()).or_not())
        .map(|(year, rest)| match rest {
            None => year,
            Some((month, None)) => format!("{}-{}", year, month),
            Some((month, Some(day))) => format!("{}-{}-{}", year, month, day),
        })
        .boxed();

    let time_text = digits(2)
        .then(
            just(':')
                .ignore_then(digits(2))
                .then(
                    just(':')
                        .ignore_then(digits(2))
                        .then(just('.').ignore_then(digit_run()).or_not())
                        .or_not(),
                )
                .or_not(),
        )
        .map(|(hours, rest)| {
            let mut time = hours;
            if let Some((minutes, seconds)) = rest {
                time.push(':');
                time.push_str(&minutes);
                if let Some((seconds, fraction)) = seconds {
                    time.push(':');
                    time.push_str(&seconds);
                    if let Some(fraction) = fraction {
                        time.push('.');
                        time.push_str(&fraction);
                    }
                }
            }
            time
        })
        .boxed();

    let timezone = choice((
        just('Z').to("Z".to_string()),
        one_of("+-")
            .then(digits(2))
            .then_ignore(just(':'))
            .then(digits(2))
            .map(|((sign, hours), minutes)| format!("{}{}:{}", sign, hours, minutes)),
    ))
    .boxed();

    let datetime = just('@')
        .ignore_then(date_text.clone())
        .then_ignore(just('T'))
        .then(time_text.clone())
        .then(timezone.clone().or_not())
        .try_map(|((date, time), zone), span| {
            let text = format!("{}T{}{}", date, time, zone.unwrap_or_default());
            if is_valid_date(&date) && is_valid_time(&time) {
                Ok(Literal::DateTime(text))
            } else {
                Err(Rich::custom(span, format!("Invalid datetime: {}", text)))
            }
        });

    let partial_datetime = just('@')
        .ignore_then(date_text.clone())
        .then_ignore(just('T'))
        .try_map(|date, span| {
            if is_valid_date(&date) {
                Ok(Literal::DateTime(format!("{}T", date)))
            } else {
                Err(Rich::custom(span, format!("Invalid datetime: {}T", date)))
            }
        });

    let time = just("@T")
        .ignore_then(time_text)
        .then(timezone.or_not())
        .try_map(|(time, zone), span| match zone {
            Some(_) => Err(Rich::custom(span, "Time literal cannot have a timezone offset")),
            None if is_valid_time(&time) => Ok(Literal::Time(time)),
            None => Err(Rich::custom(span, format!("Invalid time: {}", time))),
        });

    let date = just('@').ignore_then(date_text).try_map(|date, span| {
        if is_valid_date(&date) {
            Ok(Literal::Date(date))
        } else {
            Err(Rich::custom(span, format!("Invalid date: {}", date)))
        }
    });

    let literal = choice((
        null,
        boolean,
        string,
        quantity,
        number,
        integer,
        custom_padded(datetime),
        custom_padded(partial_datetime),
        custom_padded(time),
        custom_padded(date),
    ))
    .map(Term::Literal);

    // Identifiers

    let plain_identifier = any()
        .filter(|c: &char| c.is_ascii_alphabetic() || *c == '_')
        .then(
            any()
                .filter(|c: &char| c.is_ascii_alphanumeric() || *c == '_')
                .repeated()
                .collect::<String>(),
        )
        .map(|(first, rest): (char, String)| format!("{}{}", first, rest))
        .padded();

    let delimited_identifier = just('`')
        .ignore_then(none_of("`").or(escape).repeated().collect::<String>())
        .then_ignore(just('`'))
        .padded();

    let identifier = choice((plain_identifier, delimited_identifier));

    let type_specifier = custom_padded(
        identifier
            .clone()
            .then(just('.').ignore_then(identifier.clone()).or_not())
            .map(|(first, second)| match second {
                Some(name) => TypeSpecifier::QualifiedIdentifier(first, Some(name)),
                None => TypeSpecifier::QualifiedIdentifier(first, None),
            }),
    );

    let external_constant = just('%')
        .ignore_then(choice((identifier.clone(), quoted.clone().padded())))
        .map(Term::ExternalConstant)
        .padded();

    recursive(|expr| {
        let arguments = expr
            .clone()
            .separated_by(just(',').padded())
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just('(').padded(), just(')').padded())
            .boxed();

        let atom = custom_padded(choice((
            literal.clone().map(Expression::Term).boxed(),
            external_constant.clone().map(Expression::Term).boxed(),
            identifier
                .clone()
                .then(arguments.clone())
                .map(|(name, args)| Expression::Term(Term::Invocation(Invocation::Function(name, args))))
                .boxed(),
            choice((
                just("$this").to(Invocation::This),
                just("$index").to(Invocation::Index),
                just("$total").to(Invocation::Total),
                identifier.clone().map(Invocation::Member),
            ))
            .map(|invocation| Expression::Term(Term::Invocation(invocation)))
            .boxed(),
            expr.clone()
                .boxed()
                .delimited_by(just('(').padded(), just(')').padded())
                .map(|inner| Expression::Term(Term::Parenthesized(Box::new(inner))))
                .boxed(),
        )));

        enum Postfix {
            Invoke(Invocation),
            Index(Expression),
        }

        let postfix = choice((
            just('.')
                .ignore_then(choice((
                    just("$this").to(Invocation::This),
                    just("$index").to(Invocation::Index),
                    just("$total").to(Invocation::Total),
                    identifier.clone().then(arguments.clone().or_not()).map(|(name, args)| match args {
                        Some(args) => Invocation::Function(name, args),
                        None => Invocation::Member(name),
                    }),
                )))
                .map(Postfix::Invoke),
            expr.clone()
                .delimited_by(just('[').padded(), just(']').padded())
                .map(Postfix::Index),
        ))
        .boxed();

        let navigation = atom.then(postfix.repeated().collect::<Vec<_>>()).map(|(head, ops)| {
            ops.into_iter().fold(head, |left, op| match op {
                Postfix::Invoke(invocation) => Expression::Invocation(Box::new(left), invocation),
                Postfix::Index(index) => Expression::Indexer(Box::new(left), Box::new(index)),
            })
        });

        let polarity = one_of("+-")
            .padded()
            .repeated()
            .collect::<Vec<char>>()
            .then(navigation)
            .map(|(signs, operand)| {
                signs
                    .into_iter()
                    .rev()
                    .fold(operand, |acc, sign| Expression::Polarity(sign, Box::new(acc)))
            })
            .boxed();

        let multiplicative = polarity
            .clone()
            .foldl(
                choice((
                    just("*").to("*"),
                    just("/").to("/"),
                    text::keyword("div").to("div"),
                    text::keyword("mod").to("mod"),
                ))
                .padded()
                .then(polarity)
                .repeated(),
                |l, (op, r)| Expression::Multiplicative(Box::new(l), op.to_string(), Box::new(r)),
            )
            .boxed();

        let additive = multiplicative
            .clone()
            .foldl(
                one_of("+-&").padded().then(multiplicative).repeated(),
                |l, (op, r)| Expression::Additive(Box::new(l), op.to_string(), Box::new(r)),
            )
            .boxed();

        let union = additive
            .clone()
            .foldl(just('|').padded().ignore_then(additive).repeated(), |l, r| {
                Expression::Union(Box::new(l), Box::new(r))
            })
            .boxed();

        let inequality = union
            .clone()
            .foldl(
                choice((just("<=").to("<="), just("<").to("<"), just(">=").to(">="), just(">").to(">")))
                    .padded()
                    .then(union)
                    .repeated(),
                |l, (op, r)| Expression::Inequality(Box::new(l), op.to_string(), Box::new(r)),
            )
            .boxed();

        let type_test = inequality
            .foldl(
                choice((text::keyword("is").to("is"), text::keyword("as").to("as")))
                    .padded()
                    .then(type_specifier.clone())
                    .repeated(),
                |l, (op, t)| Expression::Type(Box::new(l), op.to_string(), t),
            )
            .boxed();

        let equality = type_test
            .clone()
            .foldl(
                choice((just("=").to("="), just("~").to("~"), just("!=").to("!="), just("!~").to("!~")))
                    .padded()
                    .then(type_test)
                    .repeated(),
                |l, (op, r)| Expression::Equality(Box::new(l), op.to_string(), Box::new(r)),
            )
            .boxed();

        let membership = equality
            .clone()
            .foldl(
                choice((text::keyword("in").to("in"), text::keyword("contains").to("contains")))
                    .padded()
                    .then(equality)
                    .repeated(),
                |l, (op, r)| Expression::Membership(Box::new(l), op.to_string(), Box::new(r)),
            )
            .boxed();

        let conjunction = membership
            .clone()
            .foldl(
                text::keyword("and").padded().ignore_then(membership).repeated(),
                |l, r| Expression::And(Box::new(l), Box::new(r)),
            )
            .boxed();

        let disjunction = conjunction
            .clone()
            .foldl(
                choice((text::keyword("or").to("or"), text::keyword("xor").to("xor")))
                    .padded()
                    .then(conjunction)
                    .repeated(),
                |l, (op, r)| Expression::Or(Box::new(l), op.to_string(), Box::new(r)),
            )
            .boxed();

        disjunction
            .clone()
            .foldl(
                text::keyword("implies").padded().ignore_then(disjunction).repeated(),
                |l, r| Expression::Implies(Box::new(l), Box::new(r)),
            )
            .boxed()
    })
    .then_ignore(end())
}

fn digits_hex<'src>() -> impl Parser<'src, &'src str, String, ParserError<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_ascii_hexdigit())
        .repeated()
        .exactly(4)
        .collect::<String>()
}
