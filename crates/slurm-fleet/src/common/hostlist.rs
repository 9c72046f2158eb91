//! Expansion of Slurm hostlist expressions, e.g. `node-[0-3,7],other-[01-02]`.
use crate::common::parser::{CharParser, ParseError, all_consuming, parse_digits};
use chumsky::Parser;
use chumsky::primitive::{filter, just};
use itertools::Itertools;

/// Upper bound on the number of names produced by a hostlist.
const MAX_HOSTLIST_LENGTH: usize = 100_000;

/// Parse a numeric range in the format `start[-end]`.
/// Leading zeros of `start` determine the width of the produced numbers.
fn parse_range() -> impl CharParser<Vec<String>> {
    let end = just('-').ignore_then(parse_digits()).or_not();
    parse_digits()
        .then(end)
        .try_map(|(start, end), span| {
            let Some(end) = end else {
                return Ok(vec![start]);
            };
            let width = if start.len() > 1 && start.starts_with('0') {
                start.len()
            } else {
                0
            };
            let first: u64 = start
                .parse()
                .map_err(|_| ParseError::custom(span.clone(), "Number is too large"))?;
            let last: u64 = end
                .parse()
                .map_err(|_| ParseError::custom(span.clone(), "Number is too large"))?;
            if last < first {
                return Err(ParseError::custom(span, "Invalid range"));
            }
            if last - first >= MAX_HOSTLIST_LENGTH as u64 {
                return Err(ParseError::custom(span, "Range is too long"));
            }
            Ok((first..=last).map(|value| format!("{value:0width$}")).collect())
        })
        .labelled("range")
}

/// Parses `[range,range,...]`.
fn parse_brackets() -> impl CharParser<Vec<String>> {
    parse_range()
        .separated_by(just(','))
        .at_least(1)
        .delimited_by(just('['), just(']'))
        .map(|ranges| ranges.into_iter().flatten().collect())
}

fn parse_name_fragment() -> impl CharParser<Vec<String>> {
    filter(|c: &char| !matches!(c, '[' | ']' | ',') && !c.is_whitespace())
        .repeated()
        .at_least(1)
        .collect::<String>()
        .map(|fragment| vec![fragment])
        .labelled("hostname")
}

/// Parses a single hostlist expression and expands it into all combinations of its
/// bracketed parts.
fn parse_expression() -> impl CharParser<Vec<String>> {
    parse_name_fragment()
        .or(parse_brackets())
        .repeated()
        .at_least(1)
        .try_map(|parts: Vec<Vec<String>>, span| {
            let count = parts
                .iter()
                .try_fold(1usize, |count, part| count.checked_mul(part.len()));
            if count.is_none_or(|count| count > MAX_HOSTLIST_LENGTH) {
                return Err(ParseError::custom(span, "Hostlist is too long"));
            }
            Ok(parts
                .into_iter()
                .multi_cartesian_product()
                .map(|fragments| fragments.concat())
                .collect())
        })
}

fn parse_hostlist_inner() -> impl CharParser<Vec<String>> {
    all_consuming(
        parse_expression()
            .separated_by(just(','))
            .at_least(1)
            .try_map(|names: Vec<Vec<String>>, span| {
                if names.iter().map(|names| names.len()).sum::<usize>() > MAX_HOSTLIST_LENGTH {
                    return Err(ParseError::custom(span, "Hostlist is too long"));
                }
                Ok(names.into_iter().flatten().unique().collect())
            }),
    )
}

/// Expands a hostlist expression into individual hostnames.
/// The order of the names is preserved and duplicates are removed.
pub fn expand_hostlist(input: &str) -> anyhow::Result<Vec<String>> {
    parse_hostlist_inner().parse_text(input.trim())
}
