//! Retention policy for stored events and snapshots.

use serde_json::Value;

/// Default retention window in days.
pub const DEFAULT_RETENTION_DAYS: u32 = 14;

/// How long trace data is kept before the sweeper deletes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retention {
    /// Delete rows older than this many days.
    Days(u32),
    /// Never delete.
    Never,
}

impl Default for Retention {
    fn default() -> Self {
        Self::Days(DEFAULT_RETENTION_DAYS)
    }
}

impl Retention {
    /// Parse from a string: `"never"` or a positive integer.
    ///
    /// Anything else yields `None` so the caller keeps its previous value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("never") {
            return Some(Self::Never);
        }
        match s.trim().parse::<u32>() {
            Ok(days) if days > 0 => Some(Self::Days(days)),
            _ => None,
        }
    }

    /// Parse from a JSON value (`"never"`, a string number, or a number).
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Self::parse(s),
            Value::Number(n) => {
                let days = u32::try_from(n.as_i64()?).ok()?;
                (days > 0).then_some(Self::Days(days))
            }
            _ => None,
        }
    }

    /// The sweep window in days, or `None` when retention is disabled.
    #[must_use]
    pub fn days(self) -> Option<u32> {
        match self {
            Self::Days(d) => Some(d),
            Self::Never => None,
        }
    }

    /// JSON representation for the `/api/config` endpoint.
    #[must_use]
    pub fn to_value(self) -> Value {
        match self {
            Self::Days(d) => Value::from(d),
            Self::Never => Value::from("never"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_is_fourteen_days() {
        assert_eq!(Retention::default(), Retention::Days(14));
    }

    #[test]
    fn parse_never_case_insensitive() {
        assert_eq!(Retention::parse("never"), Some(Retention::Never));
        assert_eq!(Retention::parse("NEVER"), Some(Retention::Never));
    }

    #[test]
    fn parse_positive_days() {
        assert_eq!(Retention::parse("7"), Some(Retention::Days(7)));
    }

    #[test]
    fn parse_rejects_zero_and_garbage() {
        assert_eq!(Retention::parse("0"), None);
        assert_eq!(Retention::parse("-3"), None);
        assert_eq!(Retention::parse("soon"), None);
    }

    #[test]
    fn from_value_number_and_string() {
        assert_eq!(Retention::from_value(&json!(30)), Some(Retention::Days(30)));
        assert_eq!(
            Retention::from_value(&json!("never")),
            Some(Retention::Never)
        );
        assert_eq!(Retention::from_value(&json!(true)), None);
        assert_eq!(Retention::from_value(&json!(0)), None);
    }

    #[test]
    fn days_and_to_value() {
        assert_eq!(Retention::Days(7).days(), Some(7));
        assert_eq!(Retention::Never.days(), None);
        assert_eq!(Retention::Days(7).to_value(), json!(7));
        assert_eq!(Retention::Never.to_value(), json!("never"));
    }
}
