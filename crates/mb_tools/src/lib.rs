#![forbid(unsafe_code)]

pub mod attr_cli;
