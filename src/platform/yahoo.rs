use super::{numeric_id, require_job_id, send_bytes, send_json, ReportPlatform, ReportStatus, USER_AGENT};
use crate::job::{DateRange, ReportJob, Source};
use crate::retry::CallError;
use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

pub const SEARCH_BASE_URL: &str = "https://ads-search.yahooapis.jp/api/v18";
pub const DISPLAY_BASE_URL: &str = "https://ads-display.yahooapis.jp/api/v18";

/// Bodies that mean "slow down", whatever the HTTP status.
pub const RATE_LIMIT_MARKERS: [&str; 2] = ["Frequency limit exceeded", "Too much requests"];

const BASE_ACCOUNT_HEADER: &str = "x-z-base-account-id";

#[derive(Deserialize)]
struct Envelope<T> {
    rval: Option<Values<T>>,
}

#[derive(Deserialize)]
struct Values<T> {
    values: Option<Vec<T>>,
}

impl<T> Envelope<T> {
    fn into_values(self) -> Vec<T> {
        self.rval.and_then(|r| r.values).unwrap_or_default()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountValue {
    #[serde(default)]
    operation_succeeded: bool,
    account: Option<Account>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Account {
    account_id: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportValue {
    #[serde(default)]
    operation_succeeded: bool,
    report_definition: Option<ReportDefinition>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportDefinition {
    report_job_id: Option<Value>,
    report_job_status: Option<String>,
}

/// Yahoo! JAPAN Search or Display Ads, ReportDefinitionService.
#[derive(Clone)]
pub struct YahooPlatform {
    client: Client,
    source: Source,
    base_url: String,
    token: String,
    base_account_id: String,
}

impl YahooPlatform {
    pub fn new(client: Client, source: Source, token: &str, base_account_id: &str) -> Self {
        let base_url = match source {
            Source::Display => DISPLAY_BASE_URL,
            _ => SEARCH_BASE_URL,
        };
        YahooPlatform {
            client,
            source,
            base_url: base_url.to_string(),
            token: token.to_string(),
            base_account_id: base_account_id.to_string(),
        }
    }

    fn headers(&self) -> Result<HeaderMap, CallError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| CallError::fatal(format!("invalid access token: {}", e)))?;
        let base = HeaderValue::from_str(&self.base_account_id)
            .map_err(|e| CallError::fatal(format!("invalid base account id: {}", e)))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(reqwest::header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        headers.insert(BASE_ACCOUNT_HEADER, base);
        Ok(headers)
    }

    async fn post<T: serde::de::DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, CallError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {} ({})", url, self.source);
        let request = self.client.post(url).headers(self.headers()?).json(body);
        send_json(request, &RATE_LIMIT_MARKERS).await
    }
}

#[async_trait]
impl ReportPlatform for YahooPlatform {
    async fn list_accounts(&self) -> Result<Vec<String>, CallError> {
        let envelope: Envelope<AccountValue> = self.post("/AccountService/get", &json!({})).await?;
        Ok(account_ids(envelope))
    }

    async fn add_report(&self, job: &ReportJob, range: &DateRange) -> Result<String, CallError> {
        let report_name = format!(
            "{}_{}_{}",
            job.source,
            job.account_id,
            chrono::Utc::now().timestamp()
        );
        let body = add_request(job, range, &report_name)?;
        let envelope: Envelope<ReportValue> = self.post("/ReportDefinitionService/add", &body).await?;
        created_job_id(envelope)
    }

    async fn report_status(&self, job: &ReportJob) -> Result<ReportStatus, CallError> {
        let body = json!({
            "accountId": numeric_id(&job.account_id, "account id")?,
            "reportJobIds": [numeric_id(require_job_id(job)?, "report job id")?],
        });
        let envelope: Envelope<ReportValue> = self.post("/ReportDefinitionService/get", &body).await?;
        Ok(job_status(envelope))
    }

    async fn download_report(&self, job: &ReportJob) -> Result<Vec<u8>, CallError> {
        let body = json!({
            "accountId": numeric_id(&job.account_id, "account id")?,
            "reportJobId": numeric_id(require_job_id(job)?, "report job id")?,
        });
        let url = format!("{}/ReportDefinitionService/download", self.base_url);
        let request = self.client.post(url).headers(self.headers()?).json(&body);
        send_bytes(request, &RATE_LIMIT_MARKERS).await
    }
}

fn add_request(job: &ReportJob, range: &DateRange, report_name: &str) -> Result<Value, CallError> {
    let mut operand = json!({
        "reportName": report_name,
        "fields": job.fields(),
        "reportDownloadFormat": "CSV",
        "reportLanguage": job.language,
        "reportDateRangeType": "CUSTOM_DATE",
        "dateRange": {
            "startDate": range.start.format("%Y%m%d").to_string(),
            "endDate": range.end.format("%Y%m%d").to_string(),
        },
    });
    if let Some(report_type) = &job.report_type {
        operand["reportType"] = json!(report_type);
    }
    Ok(json!({
        "accountId": numeric_id(&job.account_id, "account id")?,
        "operand": [operand],
    }))
}

fn account_ids(envelope: Envelope<AccountValue>) -> Vec<String> {
    let mut ids: Vec<u64> = envelope
        .into_values()
        .into_iter()
        .filter(|v| v.operation_succeeded)
        .filter_map(|v| v.account.and_then(|a| a.account_id))
        .filter_map(|id| id_string(&id).parse().ok())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids.into_iter().map(|id| id.to_string()).collect()
}

fn created_job_id(envelope: Envelope<ReportValue>) -> Result<String, CallError> {
    let first = envelope
        .into_values()
        .into_iter()
        .next()
        .filter(|v| v.operation_succeeded)
        .ok_or_else(|| CallError::fatal("/add did not succeed"))?;
    first
        .report_definition
        .and_then(|d| d.report_job_id)
        .map(|id| id_string(&id))
        .filter(|id| !id.is_empty())
        .ok_or_else(|| CallError::fatal("/add response has no reportJobId"))
}

fn job_status(envelope: Envelope<ReportValue>) -> ReportStatus {
    let status = envelope
        .into_values()
        .into_iter()
        .next()
        .and_then(|v| v.report_definition)
        .and_then(|d| d.report_job_status)
        .unwrap_or_else(|| "UNKNOWN".to_string());

    match status.as_str() {
        "COMPLETED" => ReportStatus::Completed { download_url: None },
        "FAILED" | "UNKNOWN" => ReportStatus::Failed(format!("report job status {}", status)),
        _ => ReportStatus::InProgress,
    }
}

fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}
