pub mod microsoft;
pub mod yahoo;

use crate::job::{DateRange, ReportJob};
use crate::retry::{classify_response, CallError};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;

pub const USER_AGENT: &str = concat!("ads-report-extractor/", env!("CARGO_PKG_VERSION"));

/// What a status poll reported for a submitted report.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportStatus {
    /// Ready for download. Platforms that hand out a URL put it here; a
    /// missing URL on such a platform means the report has no rows.
    Completed { download_url: Option<String> },
    InProgress,
    /// The platform gave up on the report, or reported a state we cannot act on.
    Failed(String),
}

/// An ad platform that speaks the create / poll / download report protocol.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ReportPlatform: Send + Sync + 'static {
    /// Lists advertiser accounts reachable with the run's credentials.
    async fn list_accounts(&self) -> Result<Vec<String>, CallError>;

    /// Submits a report request and returns the platform's job id.
    async fn add_report(&self, job: &ReportJob, range: &DateRange) -> Result<String, CallError>;

    async fn report_status(&self, job: &ReportJob) -> Result<ReportStatus, CallError>;

    /// Fetches the finished report body, possibly compressed.
    async fn download_report(&self, job: &ReportJob) -> Result<Vec<u8>, CallError>;
}

/// Sends `request` and decodes a JSON body, classifying failures for retry.
pub(crate) async fn send_json<T: DeserializeOwned>(
    request: RequestBuilder,
    markers: &[&str],
) -> Result<T, CallError> {
    let resp = request.send().await?;
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.text().await?;

    if let Some(err) = classify_response(status, &headers, &body, markers) {
        return Err(err);
    }
    serde_json::from_str(&body).map_err(|e| CallError::Fatal {
        status: Some(status.as_u16()),
        message: format!("unexpected response body ({}): {}", e, truncate(&body)),
    })
}

/// Sends `request` and returns the raw body of a successful response.
pub(crate) async fn send_bytes(request: RequestBuilder, markers: &[&str]) -> Result<Vec<u8>, CallError> {
    let resp = request.send().await?;
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.bytes().await?;

    // Error envelopes are small JSON documents; report bodies are not inspected.
    let looks_like_json = body.first() == Some(&b'{');
    let text = if !status.is_success() || looks_like_json {
        String::from_utf8_lossy(&body).into_owned()
    } else {
        String::new()
    };

    match classify_response(status, &headers, &text, markers) {
        Some(err) => Err(err),
        None => Ok(body.to_vec()),
    }
}

pub(crate) fn numeric_id(value: &str, what: &str) -> Result<u64, CallError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| CallError::fatal(format!("{} '{}' is not numeric", what, value)))
}

pub(crate) fn require_job_id(job: &ReportJob) -> Result<&str, CallError> {
    job.job_id
        .as_deref()
        .ok_or_else(|| CallError::fatal(format!("{} has no report job id", job.label())))
}

fn truncate(body: &str) -> String {
    body.chars().take(300).collect()
}
