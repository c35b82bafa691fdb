//! Health status for the monitoring surface

use std::fmt;

/// Severity levels, ordered so `merge` can keep the worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Level {
    #[default]
    Ok,
    Warning,
    Critical,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Ok => "OK",
            Level::Warning => "WARNING",
            Level::Critical => "CRITICAL",
        })
    }
}

/// A mergeable health verdict with diagnostic lines
#[derive(Debug, Clone, Default)]
pub struct HealthStatus {
    level: Level,
    messages: Vec<String>,
}

impl HealthStatus {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn warning(msg: impl Into<String>) -> Self {
        Self {
            level: Level::Warning,
            messages: vec![msg.into()],
        }
    }

    pub fn critical(msg: impl Into<String>) -> Self {
        Self {
            level: Level::Critical,
            messages: vec![msg.into()],
        }
    }

    /// Critical with no message of its own (the condition is implied by
    /// the already-merged lines)
    pub fn critical_silent() -> Self {
        Self {
            level: Level::Critical,
            messages: Vec::new(),
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Keep the worst level, accumulate every message
    pub fn merge(&mut self, other: HealthStatus) {
        self.level = self.level.max(other.level);
        self.messages.extend(other.messages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_worst_and_all_messages() {
        let mut s = HealthStatus::ok();
        s.merge(HealthStatus::warning("replica lagging"));
        assert_eq!(s.level(), Level::Warning);
        s.merge(HealthStatus::critical("no primary"));
        assert_eq!(s.level(), Level::Critical);
        s.merge(HealthStatus::warning("another"));
        assert_eq!(s.level(), Level::Critical);
        assert_eq!(s.messages().len(), 3);
    }

    #[test]
    fn levels_render() {
        assert_eq!(Level::Ok.to_string(), "OK");
        assert_eq!(Level::Critical.to_string(), "CRITICAL");
    }
}
