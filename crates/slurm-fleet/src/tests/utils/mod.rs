mod cloud;
mod env;
mod scheduler;

pub use cloud::{InstanceSpecBuilder, ProviderCall};
pub use env::{MemorySink, TestEnv, instance_type_record};
pub use scheduler::SchedulerCall;

use crate::common::parser::CharParser;

/// Runs the parser on the input and returns the formatted error it has to produce.
pub fn expect_parser_error<T: std::fmt::Debug>(parser: impl CharParser<T>, input: &str) -> String {
    match parser.parse_text(input) {
        Ok(value) => panic!("The parser should have failed, but it returned {value:?}"),
        Err(error) => error.to_string(),
    }
}
