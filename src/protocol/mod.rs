//! RESP2/RESP3 wire format: typed values, the incremental parser, and
//! request construction.
//!
//! Parsing and printing are exact inverses for every public value shape;
//! the streamed wire encodings are accepted on input and folded into their
//! fixed-size equivalents, so callers never see chunk artifacts.

pub mod command;
mod parser;
mod types;

pub use parser::RespParser;
pub use types::RespValue;
