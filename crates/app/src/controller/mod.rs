//! The `controller` subcommand.

mod cycle;
mod pipeline;
mod watchdog;

pub(crate) use pipeline::run;
