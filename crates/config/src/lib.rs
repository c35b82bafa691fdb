//! Keel - Process options
//!
//! Every tunable the proxy exposes, with its default, plus the duration
//! grammar shared by all time-valued flags: `<n>min`, `<n>s`, `<n>ms`,
//! `<n>us`, and the literal `inf` for "no limit".

mod duration;
mod options;

pub use duration::{parse_duration, parse_timeout, DurationParseError, Timeout};
pub use options::Options;

#[cfg(test)]
mod duration_test;
