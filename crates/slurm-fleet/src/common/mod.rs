pub mod cli;
pub mod command;
pub mod error;
pub mod hostlist;
pub mod parser;
pub mod setup;
pub mod wrapped;

pub use wrapped::WrappedRcRefCell;
