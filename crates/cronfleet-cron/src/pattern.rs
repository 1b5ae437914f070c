use std::fmt;
use std::str::FromStr;

use crate::error::{CronError, Result};

/// One position of a normalised seven-field pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Second,
    Minute,
    Hour,
    DayOfMonth,
    /// 1 is January.
    Month,
    /// 0 and 7 are both Sunday.
    DayOfWeek,
    Year,
}

impl Field {
    pub fn index(self) -> usize {
        self as usize
    }

    /// Inclusive `(min, max)` a literal in this field may take.
    pub fn bounds(self) -> (i32, i32) {
        match self {
            Field::Second | Field::Minute => (0, 59),
            Field::Hour => (0, 23),
            Field::DayOfMonth => (1, 31),
            Field::Month => (1, 12),
            Field::DayOfWeek => (0, 7),
            Field::Year => (0, 3000),
        }
    }

    fn from_index(idx: usize) -> Field {
        match idx {
            0 => Field::Second,
            1 => Field::Minute,
            2 => Field::Hour,
            3 => Field::DayOfMonth,
            4 => Field::Month,
            5 => Field::DayOfWeek,
            _ => Field::Year,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Field::Second => "second",
            Field::Minute => "minute",
            Field::Hour => "hour",
            Field::DayOfMonth => "day of month",
            Field::Month => "month",
            Field::DayOfWeek => "day of week",
            Field::Year => "year",
        };
        write!(f, "{s}")
    }
}

/// `*`, `v`, or `start-end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueRange {
    Full,
    Span { start: i32, end: Option<i32> },
}

impl fmt::Display for ValueRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueRange::Full => write!(f, "*"),
            ValueRange::Span { start, end: None } => write!(f, "{start}"),
            ValueRange::Span {
                start,
                end: Some(end),
            } => write!(f, "{start}-{end}"),
        }
    }
}

/// A range with an optional `/step` increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub range: ValueRange,
    pub step: Option<i32>,
}

impl Step {
    pub fn value(v: i32) -> Self {
        Self {
            range: ValueRange::Span {
                start: v,
                end: None,
            },
            step: None,
        }
    }

    pub fn full() -> Self {
        Self {
            range: ValueRange::Full,
            step: None,
        }
    }

    pub fn every(n: i32) -> Self {
        Self {
            range: ValueRange::Full,
            step: Some(n),
        }
    }

    /// `(start, end, increment)` this step covers within `field`.
    ///
    /// A bare literal `v` is `v-v`; `v/n` runs from `v` to the field maximum.
    pub(crate) fn parameters(&self, field: Field) -> (i32, i32, i32) {
        let (min, max) = field.bounds();
        let incr = self.step.unwrap_or(1);
        match self.range {
            ValueRange::Full => (min, max, incr),
            ValueRange::Span {
                start,
                end: Some(end),
            } => (start, end, incr),
            ValueRange::Span { start, end: None } => match self.step {
                Some(_) => (start, max, incr),
                None => (start, start, incr),
            },
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step {
            Some(step) => write!(f, "{}/{}", self.range, step),
            None => write!(f, "{}", self.range),
        }
    }
}

/// A `,`-separated list of steps for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub steps: Vec<Step>,
}

impl Component {
    pub fn full() -> Self {
        Self {
            steps: vec![Step::full()],
        }
    }

    pub fn value(v: i32) -> Self {
        Self {
            steps: vec![Step::value(v)],
        }
    }

    pub fn every(n: i32) -> Self {
        Self {
            steps: vec![Step::every(n)],
        }
    }

    /// True for a lone `*` without a step.
    pub fn is_asterisk(&self) -> bool {
        matches!(self.steps.as_slice(), [only] if *only == Step::full())
    }

    /// Reject literals outside the field, reversed ranges and bad steps.
    pub(crate) fn validate(&self, field: Field) -> Result<()> {
        let (min, max) = field.bounds();
        for step in &self.steps {
            if let ValueRange::Span { start, end } = step.range {
                for value in std::iter::once(start).chain(end) {
                    if value < min || value > max {
                        return Err(CronError::OutOfRange {
                            value,
                            field,
                            min,
                            max,
                        });
                    }
                }
                if let Some(end) = end {
                    if end < start {
                        return Err(CronError::RangeEndBeforeStart { start, end });
                    }
                }
            }
            if let Some(n) = step.step {
                if n <= 0 {
                    return Err(CronError::StepNotPositive);
                }
                if n > max - min {
                    return Err(CronError::StepTooLarge {
                        step: n,
                        field,
                        min,
                        max,
                    });
                }
                if field == Field::Year && step.range == ValueRange::Full {
                    return Err(CronError::YearFullRangeStep);
                }
            }
        }
        Ok(())
    }

    /// Whether a literal in this component can only be a year (≥ 1000).
    fn looks_like_year(&self) -> bool {
        self.steps.iter().any(|step| match step.range {
            ValueRange::Span { start, end } => start >= 1000 || end.is_some_and(|e| e >= 1000),
            ValueRange::Full => false,
        })
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{step}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Form {
    /// `10s`, `5m`, `1h`.
    Duration(String),
    /// `Mon`, `tuesday`.
    DayOfWeek(String),
    Fields(Vec<Component>),
}

/// A parsed cron pattern. `Display` renders text that parses back to an equal pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    form: Form,
}

impl Pattern {
    /// The seven normalised components, second through year.
    pub fn components(&self) -> Result<Vec<Component>> {
        match &self.form {
            Form::Duration(text) => duration_components(text),
            Form::DayOfWeek(text) => {
                let day = day_of_week_index(text)
                    .ok_or_else(|| CronError::DayOfWeek(text.clone()))?;
                let mut components = vec![Component::full(); 7];
                components[Field::DayOfWeek.index()] = Component::value(day);
                Ok(components)
            }
            Form::Fields(fields) => match fields.len() {
                5 => {
                    let mut components = Vec::with_capacity(7);
                    components.push(Component::value(0));
                    components.extend(fields.iter().cloned());
                    components.push(Component::full());
                    Ok(components)
                }
                6 if fields[5].looks_like_year() => {
                    let mut components = Vec::with_capacity(7);
                    components.push(Component::value(0));
                    components.extend(fields.iter().cloned());
                    Ok(components)
                }
                6 => {
                    let mut components = fields.clone();
                    components.push(Component::full());
                    Ok(components)
                }
                7 => Ok(fields.clone()),
                n => Err(CronError::ComponentCount(n)),
            },
        }
    }

    /// Normalised components, each checked against its field.
    pub(crate) fn validated_components(&self) -> Result<Vec<Component>> {
        let components = self.components()?;
        for (idx, component) in components.iter().enumerate() {
            component.validate(Field::from_index(idx))?;
        }
        Ok(components)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.form {
            Form::Duration(text) | Form::DayOfWeek(text) => write!(f, "{text}"),
            Form::Fields(fields) => {
                for (i, component) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{component}")?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for Pattern {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self> {
        parse(s)
    }
}

/// Parse and validate a pattern.
///
/// Validation evaluates the pattern once, so unreachable patterns such as
/// `* * 30 2 *` are rejected here rather than at first use.
pub fn parse(text: &str) -> Result<Pattern> {
    let pattern = parse_syntax(text)?;
    crate::next::validate(&pattern)?;
    Ok(pattern)
}

fn parse_syntax(text: &str) -> Result<Pattern> {
    let words = split_words(text);

    if let [(_, word)] = words.as_slice() {
        if looks_like_duration(word) {
            return Ok(Pattern {
                form: Form::Duration(word.to_string()),
            });
        }
        if day_of_week_index(word).is_some() {
            return Ok(Pattern {
                form: Form::DayOfWeek(word.to_string()),
            });
        }
    }

    let components = words
        .iter()
        .map(|(column, word)| parse_component(word, *column))
        .collect::<Result<Vec<_>>>()?;
    if !(5..=7).contains(&components.len()) {
        return Err(CronError::ComponentCount(components.len()));
    }
    Ok(Pattern {
        form: Form::Fields(components),
    })
}

/// Whitespace-separated words with their 1-based starting column.
fn split_words(text: &str) -> Vec<(usize, &str)> {
    let mut words = Vec::new();
    let mut start = None;
    for (idx, ch) in text.char_indices() {
        match (ch.is_whitespace(), start) {
            (true, Some(s)) => {
                words.push((s + 1, &text[s..idx]));
                start = None;
            }
            (false, None) => start = Some(idx),
            _ => {}
        }
    }
    if let Some(s) = start {
        words.push((s + 1, &text[s..]));
    }
    words
}

fn parse_component(word: &str, column: usize) -> Result<Component> {
    let mut cursor = Cursor {
        word,
        pos: 0,
        column,
    };
    let mut steps = vec![cursor.step()?];
    while cursor.eat(b',') {
        steps.push(cursor.step()?);
    }
    if cursor.pos < word.len() {
        return Err(cursor.unexpected());
    }
    Ok(Component { steps })
}

struct Cursor<'a> {
    word: &'a str,
    pos: usize,
    column: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<u8> {
        self.word.as_bytes().get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn step(&mut self) -> Result<Step> {
        let range = if self.eat(b'*') {
            ValueRange::Full
        } else {
            let start = self.number()?;
            let end = if self.eat(b'-') {
                Some(self.number()?)
            } else {
                None
            };
            ValueRange::Span { start, end }
        };
        let step = if self.eat(b'/') {
            Some(self.number()?)
        } else {
            None
        };
        Ok(Step { range, step })
    }

    fn number(&mut self) -> Result<i32> {
        let begin = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        if begin == self.pos {
            return Err(self.unexpected());
        }
        let digits = &self.word[begin..self.pos];
        digits.parse().map_err(|_| CronError::Syntax {
            column: self.column + begin,
            found: format!("number {digits} (too large)"),
        })
    }

    fn unexpected(&self) -> CronError {
        let found = match self.word[self.pos..].chars().next() {
            Some(ch) => format!("token {:?}", ch.to_string()),
            None => "end of component".to_string(),
        };
        CronError::Syntax {
            column: self.column + self.pos,
            found,
        }
    }
}

fn looks_like_duration(word: &str) -> bool {
    word.starts_with(|c: char| c.is_ascii_digit())
        && word.chars().any(|c| c.is_ascii_alphabetic())
        && word.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Sunday is 0. Only the first two letters are significant.
fn day_of_week_index(word: &str) -> Option<i32> {
    if word.len() < 2 || !word.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    match word[..2].to_ascii_lowercase().as_str() {
        "su" => Some(0),
        "mo" => Some(1),
        "tu" => Some(2),
        "we" => Some(3),
        "th" => Some(4),
        "fr" => Some(5),
        "sa" => Some(6),
        _ => None,
    }
}

#[derive(Default)]
struct DurationParts {
    days: i32,
    hours: i32,
    minutes: i32,
    seconds: i32,
}

fn parse_duration(text: &str) -> Result<DurationParts> {
    let invalid = |reason: &str| CronError::Duration {
        text: text.to_string(),
        reason: reason.to_string(),
    };

    let mut parts = DurationParts::default();
    let mut seen = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let digits_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits_len == 0 {
            return Err(invalid("expected a number"));
        }
        let value: i32 = rest[..digits_len]
            .parse()
            .map_err(|_| invalid("number too large"))?;
        rest = &rest[digits_len..];

        let unit_len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        if unit_len == 0 {
            return Err(invalid("missing unit"));
        }
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        if seen.contains(&unit) {
            return Err(invalid("repeated unit"));
        }
        seen.push(unit);
        match unit {
            "d" => parts.days = value,
            "h" => parts.hours = value,
            "m" => parts.minutes = value,
            "s" => parts.seconds = value,
            _ => return Err(invalid("unknown unit")),
        }
    }
    Ok(parts)
}

/// Expand a duration into components: the non-zero unit becomes `*/n`,
/// smaller units are pinned to 0 and larger ones left as `*`.
fn duration_components(text: &str) -> Result<Vec<Component>> {
    let parts = parse_duration(text)?;
    if parts.days > 0 {
        return Err(CronError::DurationWithDays);
    }

    let mut components = Vec::with_capacity(7);
    let mut seen_non_zero = false;
    for value in [parts.seconds, parts.minutes, parts.hours] {
        if value == 0 {
            components.push(if seen_non_zero {
                Component::full()
            } else {
                Component::value(0)
            });
        } else {
            if seen_non_zero {
                return Err(CronError::DurationMultipleUnits);
            }
            seen_non_zero = true;
            components.push(Component::every(value));
        }
    }
    components.extend(std::iter::repeat(Component::full()).take(4));
    Ok(components)
}
