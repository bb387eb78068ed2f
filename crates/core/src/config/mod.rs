//! Application configuration.
//!
//! A closed [`Config`] struct resolved by [`ConfigBuilder`] from
//! preconfiguration, a TOML source, `FAHRPLAN_*` environment variables
//! and built-in defaults. Old upper-case setting names are accepted with
//! a warning.

mod deprecation;
mod loading;
mod types;
mod validation;

#[cfg(test)]
mod tests;

pub use deprecation::replacement_for;
pub use loading::{ConfigBuilder, ENV_PREFIX};
pub use types::{
    BeatEntryConfig, Config, CrontabSpec, RetryPolicy, ScheduleSpec, MAX_RETRY_DELAY,
};
