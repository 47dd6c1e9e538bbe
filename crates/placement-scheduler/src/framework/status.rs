//! Plugin result codes.

use crate::error::SchedulerError;
use std::collections::HashMap;
use std::fmt;

/// Outcome of a plugin call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Code {
    /// The plugin ran correctly and found the pod schedulable.
    #[default]
    Success,
    /// Internal plugin error or unexpected input.
    Error,
    /// The pod does not fit right now; preemption might help.
    Unschedulable,
    /// The pod does not fit and preemption would not help.
    UnschedulableAndUnresolvable,
    /// A permit plugin wants the pod to wait.
    Wait,
    /// A bind plugin chose not to handle the pod.
    Skip,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "Success",
            Self::Error => "Error",
            Self::Unschedulable => "Unschedulable",
            Self::UnschedulableAndUnresolvable => "UnschedulableAndUnresolvable",
            Self::Wait => "Wait",
            Self::Skip => "Skip",
        };
        f.write_str(s)
    }
}

/// A code plus the human readable reasons behind it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    code: Code,
    reasons: Vec<String>,
}

impl Status {
    /// Build a status with one reason.
    #[must_use]
    pub fn new(code: Code, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            code,
            reasons: if reason.is_empty() { Vec::new() } else { vec![reason] },
        }
    }

    /// Build a status with several reasons.
    #[must_use]
    pub fn with_reasons(code: Code, reasons: Vec<String>) -> Self {
        Self { code, reasons }
    }

    /// The success status.
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    /// Shorthand for [`Code::Error`].
    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(Code::Error, reason)
    }

    /// Shorthand for [`Code::Unschedulable`].
    #[must_use]
    pub fn unschedulable(reason: impl Into<String>) -> Self {
        Self::new(Code::Unschedulable, reason)
    }

    /// Shorthand for [`Code::UnschedulableAndUnresolvable`].
    #[must_use]
    pub fn unresolvable(reason: impl Into<String>) -> Self {
        Self::new(Code::UnschedulableAndUnresolvable, reason)
    }

    /// The code.
    #[must_use]
    pub fn code(&self) -> Code {
        self.code
    }

    /// Reasons in the order they were added.
    #[must_use]
    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    /// All reasons joined by ", ".
    #[must_use]
    pub fn message(&self) -> String {
        self.reasons.join(", ")
    }

    /// Add a reason.
    pub fn append_reason(&mut self, reason: impl Into<String>) {
        self.reasons.push(reason.into());
    }

    /// Check for [`Code::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == Code::Success
    }

    /// Check for either unschedulable code.
    #[must_use]
    pub fn is_unschedulable(&self) -> bool {
        matches!(
            self.code,
            Code::Unschedulable | Code::UnschedulableAndUnresolvable
        )
    }

    /// Convert a non-success status into an error.
    #[must_use]
    pub fn as_error(&self) -> Option<SchedulerError> {
        (!self.is_success()).then(|| SchedulerError::Plugin(self.message()))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reasons.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message())
        }
    }
}

/// Status per plugin name.
pub type PluginToStatus = HashMap<String, Status>;

/// Status per node name.
pub type NodeToStatusMap = HashMap<String, Status>;

/// Merge statuses: Error wins over UnschedulableAndUnresolvable, which wins
/// over Unschedulable. Reasons are concatenated. Returns success when empty.
#[must_use]
pub fn merge_statuses<'a>(statuses: impl IntoIterator<Item = &'a Status>) -> Status {
    let mut merged = Status::success();
    let (mut has_error, mut has_unresolvable, mut has_unschedulable) = (false, false, false);
    for status in statuses {
        match status.code {
            Code::Error => has_error = true,
            Code::UnschedulableAndUnresolvable => has_unresolvable = true,
            Code::Unschedulable => has_unschedulable = true,
            _ => {}
        }
        merged.code = status.code;
        merged.reasons.extend(status.reasons.iter().cloned());
    }
    if has_error {
        merged.code = Code::Error;
    } else if has_unresolvable {
        merged.code = Code::UnschedulableAndUnresolvable;
    } else if has_unschedulable {
        merged.code = Code::Unschedulable;
    }
    merged
}
