//! `cronfleet-cron`: cron pattern parser and next-firing calculator.
//!
//! All evaluation happens in UTC with one-second precision.
//!
//! # Accepted forms
//!
//! | Form        | Example                 | Meaning                                      |
//! |-------------|-------------------------|----------------------------------------------|
//! | 5 fields    | `*/5 * * * *`           | minute hour day-of-month month day-of-week   |
//! | 6 fields    | `*/10 * * * * *`        | second .. day-of-week, any year              |
//! | 6 fields    | `0 12 * * * 2030`       | minute .. day-of-week, year (literal ≥ 1000) |
//! | 7 fields    | `0 0 0 29 2 * *`        | second .. day-of-week, year                  |
//! | duration    | `10s`, `5m`, `1h`       | every N units, aligned to the larger unit    |
//! | day of week | `Mon`, `friday`         | every second of that day                     |
//!
//! Each field is a `,`-separated list of steps; a step is `*`, `v` or `a-b`,
//! optionally followed by `/n`.

pub mod error;
pub mod next;
pub mod pattern;

pub use error::{CronError, Result};
pub use next::{next, next_after, validate};
pub use pattern::{parse, Component, Field, Pattern, Step, ValueRange};
