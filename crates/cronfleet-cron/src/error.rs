use thiserror::Error;

use crate::pattern::Field;

/// Errors from parsing, validating or evaluating a cron pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    /// The text does not follow the pattern grammar.
    #[error("{column}: unexpected {found}")]
    Syntax { column: usize, found: String },

    #[error("expected 5-7 components, got {0}")]
    ComponentCount(usize),

    #[error("value {value} out of allowed {field} range of {min}-{max}")]
    OutOfRange {
        value: i32,
        field: Field,
        min: i32,
        max: i32,
    },

    #[error("range end {end} is less than start {start}")]
    RangeEndBeforeStart { start: i32, end: i32 },

    #[error("step must be positive")]
    StepNotPositive,

    #[error("step {step} is larger than allowed {field} range of {min}-{max}")]
    StepTooLarge {
        step: i32,
        field: Field,
        min: i32,
        max: i32,
    },

    #[error("asterisk with a step value is not allowed for year component")]
    YearFullRangeStep,

    #[error("invalid duration {text:?}: {reason}")]
    Duration { text: String, reason: String },

    #[error("durations with days are not allowed")]
    DurationWithDays,

    #[error("only one non-zero component is allowed in a duration")]
    DurationMultipleUnits,

    #[error("invalid day of week {0:?}")]
    DayOfWeek(String),

    /// The pattern has no firing between the origin and the end of year 3000.
    #[error("could not find next time for pattern {0:?}")]
    NoNextTime(String),
}

pub type Result<T> = std::result::Result<T, CronError>;
