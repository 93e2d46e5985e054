#![forbid(unsafe_code)]

pub mod expenses_cli;
