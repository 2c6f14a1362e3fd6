//! Command line interface of the `apm-agent` binary

mod args;

pub use args::{Args, Command, SendArgs};
