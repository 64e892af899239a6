//! Admission decisions.

use serde::Serialize;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The request may proceed
    Admit,
    /// The caller is over its limit
    Reject,
}

/// A verdict plus the quota metadata an integration layer may surface
/// (for example as `X-RateLimit-*` headers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub verdict: Verdict,
    /// The configured limit (burst capacity for the bucket algorithms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Requests left in the current window; negative once over the limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,
}

impl Decision {
    /// A decision with no quota metadata.
    pub fn new(admitted: bool) -> Self {
        Self {
            verdict: if admitted { Verdict::Admit } else { Verdict::Reject },
            limit: None,
            remaining: None,
        }
    }

    /// Attach the limit.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Attach the remaining quota.
    pub fn with_remaining(mut self, remaining: i64) -> Self {
        self.remaining = Some(remaining);
        self
    }

    pub fn is_admitted(&self) -> bool {
        self.verdict == Verdict::Admit
    }
}
