#![deny(unsafe_code)]

/// Terminal front-end for the multi-model chat board.
pub mod app;
/// Command line arguments.
pub mod cli;
/// REPL command parsing.
pub mod commands;
pub mod render;
