use anyhow::anyhow;
use chumsky::Parser;
use chumsky::error::Simple;
use chumsky::primitive::{end, filter};

// Parsing infrastructure
pub trait CharParser<T>: Parser<char, T, Error = Simple<char>> + Sized {
    fn parse_text(&self, input: &str) -> anyhow::Result<T> {
        self.parse(input)
            .map_err(|errors| anyhow!("{}", format_parse_errors(input, errors)))
    }
}
impl<T, P> CharParser<T> for P where P: Parser<char, T, Error = Simple<char>> {}

pub type ParseError = Simple<char>;

/// Formats `chumsky` error into a plain string that points at the offending input.
/// Currently it handles just the first error.
pub fn format_parse_errors(input: &str, mut errors: Vec<Simple<char>>) -> String {
    use chumsky::Span;
    use std::fmt::Write;

    errors.truncate(1);
    let error = match errors.pop() {
        Some(error) => error,
        None => return "Unknown parse error".to_string(),
    };

    let mut output = String::new();

    let span = error.span();
    let expected = if error.expected().len() == 0 {
        "something else".to_string()
    } else {
        let mut expected = error
            .expected()
            .map(|expected| match expected {
                Some(expected) => expected.to_string(),
                None => "<end of input>".to_string(),
            })
            .collect::<Vec<_>>();
        expected.sort_unstable();
        expected.join(" or ")
    };

    let _ = writeln!(
        output,
        "{} found{}, expected {}:",
        if error.found().is_some() {
            "Unexpected token"
        } else {
            "Unexpected end of input"
        },
        error
            .label()
            .map(|label| format!(" while attempting to parse {label}"))
            .unwrap_or_default(),
        expected,
    );

    if input.is_empty() {
        output.push_str("(the input was empty)");
    } else {
        let _ = writeln!(output, "  {input}");
        let spaces = " ".repeat(2 + span.start());
        let note = match error.reason() {
            chumsky::error::SimpleReason::Custom(msg) => msg.clone(),
            _ => format!(
                "Unexpected {}",
                error
                    .found()
                    .map(|c| format!("token `{c}`"))
                    .unwrap_or_else(|| "end of input".to_string())
            ),
        };
        let _ = writeln!(output, "{spaces}|");
        let _ = writeln!(output, "{spaces}--- {note}");
    }

    output
}

/// Parses a non-empty sequence of decimal digits, keeping leading zeros.
pub fn parse_digits() -> impl CharParser<String> + Clone {
    filter(|c: &char| c.is_ascii_digit())
        .repeated()
        .at_least(1)
        .collect::<String>()
        .labelled("number")
}

/// Return a parser that will fail if there is any input following the text parsed by the
/// provided parser.
pub fn all_consuming<T>(parser: impl CharParser<T>) -> impl CharParser<T> {
    parser.then_ignore(end())
}
