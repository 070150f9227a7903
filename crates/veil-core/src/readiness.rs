//! Engine output matching
//!
//! The supervisor only sees the engine through its output streams. Deciding
//! that the engine is up, and pulling a useful message out of a failed start,
//! is delegated to the two traits here so the matching strategy can change
//! without touching the supervisor state machine.

/// Decides whether an output line signals that the engine is accepting traffic
pub trait ReadinessProbe: Send + Sync {
    fn is_ready(&self, line: &str) -> bool;
}

/// Extracts the most specific error message from captured engine output
pub trait DiagnosticExtractor: Send + Sync {
    fn extract(&self, output: &[String]) -> Option<String>;
}

/// Case-insensitive substring match against a list of markers
#[derive(Debug, Clone)]
pub struct MarkerProbe {
    markers: Vec<String>,
}

impl MarkerProbe {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(|m| m.into().to_ascii_lowercase())
                .collect(),
        }
    }
}

impl Default for MarkerProbe {
    fn default() -> Self {
        Self::new(["started", "listening"])
    }
}

impl ReadinessProbe for MarkerProbe {
    fn is_ready(&self, line: &str) -> bool {
        let line = line.to_ascii_lowercase();
        self.markers.iter().any(|m| line.contains(m.as_str()))
    }
}

/// Longest diagnostic surfaced to callers
const MAX_DIAGNOSTIC_LEN: usize = 300;

/// Prefers the engine's own failure line, then any error-looking line,
/// then the last thing the engine printed
#[derive(Debug, Clone)]
pub struct FailureLineExtractor {
    /// Prefixes whose remainder is the actual reason
    prefixes: Vec<String>,
    /// Keywords that mark a line as an error
    keywords: Vec<String>,
}

impl Default for FailureLineExtractor {
    fn default() -> Self {
        Self {
            prefixes: vec!["failed to start:".into()],
            keywords: vec!["failed".into(), "error".into(), "panic".into()],
        }
    }
}

impl DiagnosticExtractor for FailureLineExtractor {
    fn extract(&self, output: &[String]) -> Option<String> {
        let lines: Vec<&str> = output
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect();

        for line in lines.iter().rev() {
            let lower = line.to_ascii_lowercase();
            for prefix in &self.prefixes {
                if let Some(pos) = lower.find(prefix.as_str()) {
                    let reason = line[pos + prefix.len()..].trim();
                    if !reason.is_empty() {
                        return Some(truncate(reason));
                    }
                }
            }
        }

        lines
            .iter()
            .rev()
            .find(|line| {
                let lower = line.to_ascii_lowercase();
                self.keywords.iter().any(|k| lower.contains(k.as_str()))
            })
            .or_else(|| lines.last())
            .map(|line| truncate(line))
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_DIAGNOSTIC_LEN {
        return text.to_string();
    }
    let mut end = MAX_DIAGNOSTIC_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
