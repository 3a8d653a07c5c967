//! The `stream` tag carried by every trace event.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which logical stream an event belongs to.
///
/// Assigned by the tracer; stored verbatim and used by the UI to group the
/// timeline. `ForkInfo` and `Rewind` are emitted by the daemon itself when it
/// writes placeholder and audit events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Lifecycle,
    Assistant,
    Tool,
    Error,
    ForkInfo,
    Rewind,
}

impl Stream {
    /// The canonical wire string for this stream.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lifecycle => "lifecycle",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::Error => "error",
            Self::ForkInfo => "fork_info",
            Self::Rewind => "rewind",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lifecycle" => Ok(Self::Lifecycle),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            "error" => Ok(Self::Error),
            "fork_info" => Ok(Self::ForkInfo),
            "rewind" => Ok(Self::Rewind),
            other => Err(format!("unknown stream: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_variants() {
        for s in [
            Stream::Lifecycle,
            Stream::Assistant,
            Stream::Tool,
            Stream::Error,
            Stream::ForkInfo,
            Stream::Rewind,
        ] {
            assert_eq!(s.as_str().parse::<Stream>().unwrap(), s);
        }
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&Stream::ForkInfo).unwrap();
        assert_eq!(json, "\"fork_info\"");
        let back: Stream = serde_json::from_str("\"lifecycle\"").unwrap();
        assert_eq!(back, Stream::Lifecycle);
    }

    #[test]
    fn unknown_stream_rejected() {
        assert!("telemetry".parse::<Stream>().is_err());
    }
}
