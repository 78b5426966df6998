//! Limit definitions and the kernel's default thresholds.

/// How a [`Limit`]'s key is matched against stat keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// The key must match exactly.
    Exact,
    /// Any stat key beginning with this prefix matches.
    Prefix,
}

/// A rule binding a stat key to a maximum value. Comparison is strictly
/// `current > max` — evaluated against both counters and gauges at the
/// matched key(s).
#[derive(Debug, Clone, PartialEq)]
pub struct Limit {
    /// Whether `key` is matched exactly or as a prefix.
    pub kind: LimitKind,
    /// The stat key (or prefix) this limit watches.
    pub key: String,
    /// The maximum value the matched stat(s) may reach.
    pub max: u64,
}

impl Limit {
    /// Build an exact-match limit.
    pub fn exact(key: impl Into<String>, max: u64) -> Self {
        Limit {
            kind: LimitKind::Exact,
            key: key.into(),
            max,
        }
    }

    /// Build a prefix-match limit.
    pub fn prefix(key: impl Into<String>, max: u64) -> Self {
        Limit {
            kind: LimitKind::Prefix,
            key: key.into(),
            max,
        }
    }
}

/// Reserved stat key for the iteration counter. External mutation is
/// silently ignored; only the executor increments it, via
/// [`crate::context::ExecutionContext::publish_before_iteration`].
pub const ITERATIONS_KEY: &str = "gent:iterations";

/// Stat key family for consecutive parse errors, one per
/// [`ParseErrorKind`](crate::event::ParseErrorKind).
pub const FORMAT_PARSE_ERROR_CONSECUTIVE_KEY: &str = "gent:format_parse_error_consecutive";
/// See [`FORMAT_PARSE_ERROR_CONSECUTIVE_KEY`].
pub const TOOLCHAIN_PARSE_ERROR_CONSECUTIVE_KEY: &str = "gent:toolchain_parse_error_consecutive";
/// See [`FORMAT_PARSE_ERROR_CONSECUTIVE_KEY`].
pub const TERMINATION_PARSE_ERROR_CONSECUTIVE_KEY: &str =
    "gent:termination_parse_error_consecutive";
/// See [`FORMAT_PARSE_ERROR_CONSECUTIVE_KEY`].
pub const SECTION_PARSE_ERROR_CONSECUTIVE_KEY: &str = "gent:section_parse_error_consecutive";

/// Consecutive tool-call failures, reset by the kernel on the next
/// successful tool call.
pub const TOOL_ERROR_CONSECUTIVE_KEY: &str = "gent:tool_error_consecutive";

/// Total answer rejections across all validators.
pub const VALIDATOR_REJECTED_TOTAL_KEY: &str = "gent:validator_rejected_total";

/// The kernel's built-in limits, wired onto every root context at
/// construction and inherited by every spawned child. Callers replace
/// this list wholesale with
/// [`ExecutionContext::set_limits`](crate::context::ExecutionContext::set_limits)
/// before execution begins.
pub fn default_limits() -> Vec<Limit> {
    vec![
        Limit::exact(ITERATIONS_KEY, 100),
        Limit::exact(FORMAT_PARSE_ERROR_CONSECUTIVE_KEY, 3),
        Limit::exact(TOOLCHAIN_PARSE_ERROR_CONSECUTIVE_KEY, 3),
        Limit::exact(TERMINATION_PARSE_ERROR_CONSECUTIVE_KEY, 3),
        Limit::exact(SECTION_PARSE_ERROR_CONSECUTIVE_KEY, 3),
        Limit::exact(TOOL_ERROR_CONSECUTIVE_KEY, 3),
        Limit::exact(VALIDATOR_REJECTED_TOTAL_KEY, 10),
    ]
}
