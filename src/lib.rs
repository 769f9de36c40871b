pub mod cli;
pub mod load_config;
pub mod selection;

pub use cli::{run, Cli, Commands};
