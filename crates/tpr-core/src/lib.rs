//! Core data model for the Timus mirror: remote records, linked users and sync targets.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tpr-core";

/// Judge verdict as printed by the remote status feed.
///
/// The set is closed upstream but grows occasionally, so anything unrecognised
/// lands in [`Verdict::Unknown`] with the remote text preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Verdict {
    Accepted,
    CheckerFailed,
    CompilationError,
    CompilationErrorIdlenessLimitExceeded,
    CompilationErrorMemoryLimitExceeded,
    CompilationErrorOutputLimitExceeded,
    CompilationErrorTimeLimitExceeded,
    IdlenessLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    RestrictedFunction,
    RuntimeError,
    RuntimeErrorAccessViolation,
    RuntimeErrorArrayBoundsExceeded,
    RuntimeErrorFloatDivisionByZero,
    RuntimeErrorFloatInexactResult,
    RuntimeErrorFloatInvalidOperation,
    RuntimeErrorFloatOverflow,
    RuntimeErrorIllegalInstruction,
    RuntimeErrorIntegerDivisionByZero,
    RuntimeErrorIntegerOverflow,
    RuntimeErrorNonZeroExitCode,
    RuntimeErrorPrivilegedInstruction,
    RuntimeErrorStackOverflow,
    TimeLimitExceeded,
    WrongAnswer,
    Unknown(String),
}

const KNOWN_VERDICTS: &[(&str, Verdict)] = &[
    ("Accepted", Verdict::Accepted),
    ("Checker failed", Verdict::CheckerFailed),
    ("Compilation error", Verdict::CompilationError),
    (
        "Compilation error (idleness limit exceeded)",
        Verdict::CompilationErrorIdlenessLimitExceeded,
    ),
    (
        "Compilation error (memory limit exceeded)",
        Verdict::CompilationErrorMemoryLimitExceeded,
    ),
    (
        "Compilation error (output limit exceeded)",
        Verdict::CompilationErrorOutputLimitExceeded,
    ),
    (
        "Compilation error (time limit exceeded)",
        Verdict::CompilationErrorTimeLimitExceeded,
    ),
    ("Idleness limit exceeded", Verdict::IdlenessLimitExceeded),
    ("Memory limit exceeded", Verdict::MemoryLimitExceeded),
    ("Output limit exceeded", Verdict::OutputLimitExceeded),
    ("Restricted function", Verdict::RestrictedFunction),
    ("Runtime error", Verdict::RuntimeError),
    ("Runtime error (access violation)", Verdict::RuntimeErrorAccessViolation),
    ("Runtime error (array bounds exceeded)", Verdict::RuntimeErrorArrayBoundsExceeded),
    (
        "Runtime error (floating-point division by zero)",
        Verdict::RuntimeErrorFloatDivisionByZero,
    ),
    (
        "Runtime error (floating-point inexact result)",
        Verdict::RuntimeErrorFloatInexactResult,
    ),
    (
        "Runtime error (floating-point invalid operation)",
        Verdict::RuntimeErrorFloatInvalidOperation,
    ),
    ("Runtime error (floating-point overflow)", Verdict::RuntimeErrorFloatOverflow),
    ("Runtime error (illegal instruction)", Verdict::RuntimeErrorIllegalInstruction),
    (
        "Runtime error (integer division by zero)",
        Verdict::RuntimeErrorIntegerDivisionByZero,
    ),
    ("Runtime error (integer overflow)", Verdict::RuntimeErrorIntegerOverflow),
    ("Runtime error (non-zero exit code)", Verdict::RuntimeErrorNonZeroExitCode),
    (
        "Runtime error (privileged instruction)",
        Verdict::RuntimeErrorPrivilegedInstruction,
    ),
    ("Runtime error (stack overflow)", Verdict::RuntimeErrorStackOverflow),
    ("Time limit exceeded", Verdict::TimeLimitExceeded),
    ("Wrong answer", Verdict::WrongAnswer),
];

impl Verdict {
    /// Text exactly as the remote prints it.
    pub fn as_str(&self) -> &str {
        if let Self::Unknown(text) = self {
            return text;
        }
        KNOWN_VERDICTS
            .iter()
            .find(|(_, v)| v == self)
            .map(|(text, _)| *text)
            .unwrap_or_default()
    }

    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        KNOWN_VERDICTS
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(text))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| Self::Unknown(text.to_string()))
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<String> for Verdict {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Verdict> for String {
    fn from(value: Verdict) -> Self {
        match value {
            Verdict::Unknown(text) => text,
            known => known.as_str().to_string(),
        }
    }
}

/// One row of the remote submission feed. Immutable once observed; identity is `submit_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSubmission {
    pub submit_id: u64,
    pub author_id: u64,
    pub problem_id: u32,
    pub submitted_at: NaiveDateTime,
    pub language: String,
    pub verdict: Verdict,
    pub test_index: u32,
    pub runtime_ms: u32,
    pub memory_kb: u32,
}

/// Catalog row: what the problem set table knows about a problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemInfo {
    pub number: u32,
    pub title: String,
    pub difficulty: u32,
    pub solved_count: u32,
}

/// What the printable problem page knows about a problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDetail {
    pub number: u32,
    pub title: String,
    pub limits_text: String,
    pub statement_text: String,
}

/// Latest observed version of a problem; identity is `number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProblem {
    pub number: u32,
    pub title: String,
    pub difficulty: u32,
    pub solved_count: u32,
    pub limits_text: String,
    pub statement_text: String,
}

impl RemoteProblem {
    /// Merge a catalog row with its detail page. Catalog title wins: the detail
    /// page title is the printable one and may carry decorations.
    pub fn from_parts(info: ProblemInfo, detail: ProblemDetail) -> Self {
        Self {
            number: info.number,
            title: info.title,
            difficulty: info.difficulty,
            solved_count: info.solved_count,
            limits_text: detail.limits_text,
            statement_text: detail.statement_text,
        }
    }
}

/// Mapping from an external chat identity to a remote author id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedUser {
    pub local_id: i64,
    pub external_chat_id: u64,
    pub remote_author_id: u32,
}

/// Filters for one submissions page. Absent filters are omitted from the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionQuery {
    pub author_id: Option<u32>,
    pub problem_number: Option<u32>,
    pub count: Option<u32>,
    /// Inclusive upper bound on `submit_id`.
    pub before_id: Option<u64>,
    pub accepted_only: bool,
}

impl SubmissionQuery {
    pub fn for_target(target: SyncTarget) -> Self {
        Self {
            author_id: target.author_id(),
            ..Self::default()
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_before_id(mut self, before_id: Option<u64>) -> Self {
        self.before_id = before_id;
        self
    }

    pub fn with_problem(mut self, number: u32) -> Self {
        self.problem_number = Some(number);
        self
    }

    pub fn accepted_only(mut self, accepted_only: bool) -> Self {
        self.accepted_only = accepted_only;
        self
    }
}

/// What a sync mirrors: one author's submissions or the unfiltered feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncTarget {
    Author(u32),
    Global,
}

impl SyncTarget {
    pub fn author_id(self) -> Option<u32> {
        match self {
            Self::Author(id) => Some(id),
            Self::Global => None,
        }
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Author(id) => write!(f, "author:{id}"),
            Self::Global => f.write_str("global"),
        }
    }
}
