//! Timus page parsers + the HTTP client that feeds them.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tpr_core::{ProblemDetail, ProblemInfo, RemoteSubmission, SubmissionQuery, Verdict};
use tpr_storage::{FetchError, Transport};
use tracing::debug;

pub const CRATE_NAME: &str = "tpr-adapters";

pub const SUBMISSIONS_PATH: &str = "textstatus.aspx";
pub const CATALOG_PATH: &str = "problemset.aspx";
pub const PROBLEM_PATH: &str = "print.aspx";

const SUBMISSION_COLUMNS: usize = 10;
const CATALOG_COLUMNS: usize = 6;
const DATE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("row {row}: expected {expected} columns, found {found}")]
    ColumnCount {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("row {row}: invalid {field} value {value:?}")]
    InvalidField {
        row: usize,
        field: &'static str,
        value: String,
    },
    #[error("feed has no header row; first line starts with id {first_cell:?}")]
    MissingHeader { first_cell: String },
    #[error("invalid {field} text {value:?}")]
    InvalidText { field: &'static str, value: String },
    #[error("page has no element matching {0}")]
    MissingElement(&'static str),
    #[error("bad selector {selector}: {message}")]
    Selector {
        selector: &'static str,
        message: String,
    },
}

/// Parse the tab-separated submissions feed. The first line is a header; blank
/// lines are ignored. Any malformed row fails the whole page, and so does a
/// first line that already looks like data.
pub fn parse_submissions(raw: &str) -> Result<Vec<RemoteSubmission>, ParseError> {
    let mut lines = raw.lines().enumerate();
    if let Some((_, header)) = lines.next() {
        let lead = header.split('\t').next().unwrap_or_default().trim();
        if lead.parse::<u64>().is_ok() {
            return Err(ParseError::MissingHeader {
                first_cell: lead.to_string(),
            });
        }
    }

    lines
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| parse_submission_row(idx + 1, line))
        .collect()
}

fn parse_submission_row(row: usize, line: &str) -> Result<RemoteSubmission, ParseError> {
    let cells: Vec<&str> = line.split('\t').collect();
    let &[submit_id, date, author_id, _author_name, problem_id, language, verdict, test, time, memory] =
        cells.as_slice()
    else {
        return Err(ParseError::ColumnCount {
            row,
            expected: SUBMISSION_COLUMNS,
            found: cells.len(),
        });
    };

    Ok(RemoteSubmission {
        submit_id: parse_required(row, "submit_id", submit_id)?,
        submitted_at: parse_timestamp(row, date)?,
        author_id: parse_required(row, "author_id", author_id)?,
        problem_id: parse_required(row, "problem_id", problem_id)?,
        language: language.trim().to_string(),
        verdict: Verdict::parse(verdict),
        test_index: parse_count(row, "test_index", test)?,
        runtime_ms: parse_runtime_ms(row, time)?,
        memory_kb: parse_count(row, "memory_kb", strip_suffix_ignore_case(memory.trim(), "KB"))?,
    })
}

fn parse_required<T: std::str::FromStr>(row: usize, field: &'static str, raw: &str) -> Result<T, ParseError> {
    raw.trim().parse().map_err(|_| ParseError::InvalidField {
        row,
        field,
        value: raw.to_string(),
    })
}

/// Blank cells mean "not reported" (e.g. compilation errors have no test).
fn parse_count(row: usize, field: &'static str, raw: &str) -> Result<u32, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    parse_required(row, field, trimmed)
}

fn parse_runtime_ms(row: usize, raw: &str) -> Result<u32, ParseError> {
    let trimmed = raw.trim();
    if !trimmed.contains('.') {
        return parse_count(row, "runtime_ms", trimmed);
    }
    let invalid = || ParseError::InvalidField {
        row,
        field: "runtime_ms",
        value: raw.to_string(),
    };
    let secs: f64 = trimmed.parse().map_err(|_| invalid())?;
    let ms = (secs * 1000.0).round();
    if !ms.is_finite() || ms < 0.0 || ms > f64::from(u32::MAX) {
        return Err(invalid());
    }
    Ok(ms as u32)
}

fn parse_timestamp(row: usize, raw: &str) -> Result<NaiveDateTime, ParseError> {
    let trimmed = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .ok_or_else(|| ParseError::InvalidField {
            row,
            field: "submitted_at",
            value: raw.to_string(),
        })
}

fn strip_suffix_ignore_case<'a>(value: &'a str, suffix: &str) -> &'a str {
    let split = value.len().saturating_sub(suffix.len());
    match (value.get(..split), value.get(split..)) {
        (Some(head), Some(tail)) if tail.eq_ignore_ascii_case(suffix) => head,
        _ => value,
    }
}

fn selector(css: &'static str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector {
        selector: css,
        message: e.to_string(),
    })
}

fn select_first<'a>(document: &'a Html, css: &'static str) -> Result<ElementRef<'a>, ParseError> {
    let sel = selector(css)?;
    document
        .select(&sel)
        .next()
        .ok_or(ParseError::MissingElement(css))
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

/// Parse the full problem set table. The first `.content` row is the table header.
pub fn parse_problem_catalog(html: &str) -> Result<Vec<ProblemInfo>, ParseError> {
    let document = Html::parse_document(html);
    let table = select_first(&document, ".problemset")?;
    let row_sel = selector(".content")?;
    let cell_sel = selector("td")?;

    table
        .select(&row_sel)
        .enumerate()
        .skip(1)
        .map(|(idx, tr)| {
            let row = idx + 1;
            let cells: Vec<String> = tr.select(&cell_sel).map(element_text).collect();
            let [_, number, title, _, solved_count, difficulty] = cells.as_slice() else {
                return Err(ParseError::ColumnCount {
                    row,
                    expected: CATALOG_COLUMNS,
                    found: cells.len(),
                });
            };
            Ok(ProblemInfo {
                number: parse_required(row, "number", number)?,
                title: title.clone(),
                difficulty: parse_count(row, "difficulty", difficulty)?,
                solved_count: parse_count(row, "solved_count", solved_count)?,
            })
        })
        .collect()
}

/// Parse a printable problem page: `"<number>. <title>"`, limits lines and the statement markup.
pub fn parse_problem_detail(html: &str) -> Result<ProblemDetail, ParseError> {
    let document = Html::parse_document(html);

    let heading = element_text(select_first(&document, ".problem_title")?);
    let (number, title) = heading
        .split_once('.')
        .ok_or_else(|| ParseError::InvalidText {
            field: "problem_title",
            value: heading.clone(),
        })?;
    let number = number.trim().parse().map_err(|_| ParseError::InvalidText {
        field: "problem_title",
        value: heading.clone(),
    })?;

    let limits_text = select_first(&document, ".problem_limits")?
        .text()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let statement_text = select_first(&document, "#problem_text")?.html();

    Ok(ProblemDetail {
        number,
        title: title.trim().to_string(),
        limits_text,
        statement_text,
    })
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed remote page: {0}")]
    Parse(#[from] ParseError),
    #[error("invalid remote url {0}")]
    InvalidUrl(String),
}

/// Paged access to the submission feed. The sync engine only sees this seam.
#[async_trait]
pub trait SubmissionSource: Send + Sync {
    /// One page, in the order the remote returned it (newest first).
    async fn get_submissions(&self, query: &SubmissionQuery) -> Result<Vec<RemoteSubmission>, ClientError>;
}

#[async_trait]
pub trait ProblemSource: Send + Sync {
    async fn get_problem_catalog(&self) -> Result<Vec<ProblemInfo>, ClientError>;
    async fn get_problem_detail(&self, number: u32) -> Result<ProblemDetail, ClientError>;
}

#[derive(Debug, Clone)]
struct Endpoints {
    submissions: Url,
    catalog: Url,
    problem: Url,
}

#[derive(Debug)]
pub struct TimusClient<T> {
    transport: T,
    endpoints: Endpoints,
}

impl<T: Transport> TimusClient<T> {
    pub fn new(base_url: &str, transport: T) -> Result<Self, ClientError> {
        let mut base = Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(base_url.to_string()));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let join = |path: &str| {
            base.join(path)
                .map_err(|e| ClientError::InvalidUrl(format!("{base}{path}: {e}")))
        };
        let endpoints = Endpoints {
            submissions: join(SUBMISSIONS_PATH)?,
            catalog: join(CATALOG_PATH)?,
            problem: join(PROBLEM_PATH)?,
        };
        Ok(Self {
            transport,
            endpoints,
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Absent filters are left out of the query string entirely.
    pub fn submissions_url(&self, query: &SubmissionQuery) -> Url {
        let mut pairs: Vec<(&str, String)> = Vec::new();
        if let Some(before_id) = query.before_id {
            pairs.push(("from", before_id.to_string()));
        }
        if let Some(author_id) = query.author_id {
            pairs.push(("author", author_id.to_string()));
        }
        if let Some(number) = query.problem_number {
            pairs.push(("num", number.to_string()));
        }
        if let Some(count) = query.count {
            pairs.push(("count", count.to_string()));
        }
        if query.accepted_only {
            pairs.push(("status", "accepted".to_string()));
        }

        let mut url = self.endpoints.submissions.clone();
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        url
    }

    pub fn catalog_url(&self) -> Url {
        let mut url = self.endpoints.catalog.clone();
        url.query_pairs_mut().append_pair("page", "all");
        url
    }

    pub fn problem_url(&self, number: u32) -> Url {
        let mut url = self.endpoints.problem.clone();
        url.query_pairs_mut().append_pair("num", &number.to_string());
        url
    }

    async fn fetch_text(&self, url: &Url) -> Result<String, ClientError> {
        let resp = self.transport.get(url).await?;
        Ok(resp.body)
    }
}

#[async_trait]
impl<T: Transport> SubmissionSource for TimusClient<T> {
    async fn get_submissions(&self, query: &SubmissionQuery) -> Result<Vec<RemoteSubmission>, ClientError> {
        let url = self.submissions_url(query);
        let body = self.fetch_text(&url).await?;
        let page = parse_submissions(&body)?;
        debug!(%url, records = page.len(), "submissions page");
        Ok(page)
    }
}

#[async_trait]
impl<T: Transport> ProblemSource for TimusClient<T> {
    async fn get_problem_catalog(&self) -> Result<Vec<ProblemInfo>, ClientError> {
        let body = self.fetch_text(&self.catalog_url()).await?;
        Ok(parse_problem_catalog(&body)?)
    }

    async fn get_problem_detail(&self, number: u32) -> Result<ProblemDetail, ClientError> {
        let body = self.fetch_text(&self.problem_url(number)).await?;
        Ok(parse_problem_detail(&body)?)
    }
}
