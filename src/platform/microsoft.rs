use super::{numeric_id, require_job_id, send_bytes, send_json, ReportPlatform, ReportStatus, USER_AGENT};
use crate::error::Error;
use crate::job::{DateRange, ReportJob};
use crate::retry::CallError;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use log::{debug, info};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::Mutex;
use url::Url;

pub const RATE_LIMIT_MARKERS: [&str; 1] = ["CallRateExceeded"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Production,
    Sandbox,
}

impl Environment {
    fn reporting_url(&self) -> &'static str {
        match self {
            Environment::Production => "https://reporting.api.bingads.microsoft.com/Reporting/v13",
            Environment::Sandbox => "https://reporting.api.sandbox.bingads.microsoft.com/Reporting/v13",
        }
    }

    fn customer_url(&self) -> &'static str {
        match self {
            Environment::Production => {
                "https://clientcenter.api.bingads.microsoft.com/CustomerManagement/v13"
            }
            Environment::Sandbox => {
                "https://clientcenter.api.sandbox.bingads.microsoft.com/CustomerManagement/v13"
            }
        }
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "sandbox" => Ok(Environment::Sandbox),
            other => Err(Error::UnknownEnvironment(other.to_string())),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AccountsInfoResponse {
    #[serde(default)]
    accounts_info: Vec<AccountInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AccountInfo {
    id: Option<Value>,
    name: Option<String>,
    account_life_cycle_status: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AccountResponse {
    account: Option<AccountDetail>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AccountDetail {
    parent_customer_id: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SubmitResponse {
    report_request_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PollResponse {
    report_request_status: Option<RequestStatus>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RequestStatus {
    status: Option<String>,
    report_download_url: Option<String>,
}

/// Microsoft Advertising, Reporting and Customer Management v13 REST.
pub struct MicrosoftPlatform {
    client: Client,
    environment: Environment,
    token: String,
    developer_token: String,
    customer_id: Option<String>,
    /// Parent customer per account, resolved on first use.
    customers: Mutex<HashMap<String, String>>,
}

impl MicrosoftPlatform {
    pub fn new(
        client: Client,
        environment: Environment,
        token: &str,
        developer_token: &str,
        customer_id: Option<&str>,
    ) -> Self {
        MicrosoftPlatform {
            client,
            environment,
            token: token.to_string(),
            developer_token: developer_token.to_string(),
            customer_id: customer_id.map(str::to_string),
            customers: Mutex::new(HashMap::new()),
        }
    }

    fn headers(&self, customer_id: Option<&str>, account_id: Option<&str>) -> Result<HeaderMap, CallError> {
        let value = |v: &str| {
            HeaderValue::from_str(v).map_err(|e| CallError::fatal(format!("invalid header value: {}", e)))
        };

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value(&format!("Bearer {}", self.token))?);
        headers.insert("developertoken", value(&self.developer_token)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(reqwest::header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        if let Some(customer_id) = customer_id {
            headers.insert("customerid", value(customer_id)?);
        }
        if let Some(account_id) = account_id {
            headers.insert("customeraccountid", value(account_id)?);
        }
        Ok(headers)
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        headers: HeaderMap,
        body: &Value,
    ) -> Result<T, CallError> {
        debug!("POST {}", url);
        let request = self.client.post(url).headers(headers).json(body);
        send_json(request, &RATE_LIMIT_MARKERS).await
    }

    /// The customer that owns `account_id`; reporting calls must name it.
    async fn parent_customer(&self, account_id: &str) -> Result<String, CallError> {
        if let Some(customer_id) = &self.customer_id {
            return Ok(customer_id.clone());
        }
        if let Some(customer_id) = self.customers.lock().await.get(account_id) {
            return Ok(customer_id.clone());
        }

        let url = format!("{}/Account/Query", self.environment.customer_url());
        let body = json!({ "AccountId": numeric_id(account_id, "account id")? });
        let resp: AccountResponse = self.post(url, self.headers(None, None)?, &body).await?;
        let customer_id = resp
            .account
            .and_then(|a| a.parent_customer_id)
            .map(|id| id_string(&id))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                CallError::fatal(format!("no parent customer found for account {}", account_id))
            })?;

        self.customers
            .lock()
            .await
            .insert(account_id.to_string(), customer_id.clone());
        Ok(customer_id)
    }
}

#[async_trait]
impl ReportPlatform for MicrosoftPlatform {
    async fn list_accounts(&self) -> Result<Vec<String>, CallError> {
        let url = format!("{}/AccountsInfo/Query", self.environment.customer_url());
        let body = json!({
            "CustomerId": self.customer_id.as_deref().map(|c| numeric_id(c, "customer id")).transpose()?,
            "OnlyParentAccounts": false,
        });
        let resp: AccountsInfoResponse = self
            .post(url, self.headers(self.customer_id.as_deref(), None)?, &body)
            .await?;
        Ok(account_ids(resp))
    }

    async fn add_report(&self, job: &ReportJob, range: &DateRange) -> Result<String, CallError> {
        let customer_id = self.parent_customer(&job.account_id).await?;
        let url = format!("{}/GenerateReport/Submit", self.environment.reporting_url());
        let body = submit_request(job, range)?;
        let resp: SubmitResponse = self
            .post(url, self.headers(Some(&customer_id), Some(&job.account_id))?, &body)
            .await?;
        resp.report_request_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CallError::fatal("Submit response has no ReportRequestId"))
    }

    async fn report_status(&self, job: &ReportJob) -> Result<ReportStatus, CallError> {
        let customer_id = self.parent_customer(&job.account_id).await?;
        let url = format!("{}/GenerateReport/Poll", self.environment.reporting_url());
        let body = json!({ "ReportRequestId": require_job_id(job)? });
        let resp: PollResponse = self
            .post(url, self.headers(Some(&customer_id), Some(&job.account_id))?, &body)
            .await?;
        Ok(poll_status(resp))
    }

    async fn download_report(&self, job: &ReportJob) -> Result<Vec<u8>, CallError> {
        let Some(url) = job.download_url.as_deref() else {
            info!("{}: report finished without a download URL, no data", job.label());
            return Ok(Vec::new());
        };
        let url = Url::parse(url)
            .map_err(|e| CallError::fatal(format!("invalid report download URL '{}': {}", url, e)))?;
        send_bytes(self.client.get(url), &RATE_LIMIT_MARKERS).await
    }
}

fn date_parts(date: NaiveDate) -> Value {
    json!({ "Day": date.day(), "Month": date.month(), "Year": date.year() })
}

fn submit_request(job: &ReportJob, range: &DateRange) -> Result<Value, CallError> {
    let report_type = job
        .report_type
        .as_deref()
        .ok_or_else(|| CallError::fatal(format!("{} has no report type", job.label())))?;

    Ok(json!({
        "ReportRequest": {
            "Type": report_type,
            "ReportName": format!("{}_{}", job.entity, job.account_id),
            "Format": "Csv",
            "FormatVersion": "2.0",
            "ExcludeColumnHeaders": false,
            "ExcludeReportFooter": false,
            "ExcludeReportHeader": false,
            "ReturnOnlyCompleteData": false,
            "Aggregation": "Daily",
            "Columns": job.fields(),
            "Scope": { "AccountIds": [numeric_id(&job.account_id, "account id")?] },
            "Time": {
                "CustomDateRangeStart": date_parts(range.start),
                "CustomDateRangeEnd": date_parts(range.end),
            },
        }
    }))
}

fn account_ids(resp: AccountsInfoResponse) -> Vec<String> {
    let mut ids = Vec::new();
    for account in resp.accounts_info {
        let Some(id) = account.id.as_ref().map(id_string).filter(|id| !id.is_empty()) else {
            continue;
        };
        debug!(
            "account {} {:?} status={:?}",
            id, account.name, account.account_life_cycle_status
        );
        ids.push(id);
    }
    ids.sort();
    ids.dedup();
    ids
}

fn poll_status(resp: PollResponse) -> ReportStatus {
    let Some(status) = resp.report_request_status else {
        return ReportStatus::Failed("Poll response has no ReportRequestStatus".to_string());
    };
    match status.status.as_deref() {
        Some("Success") => ReportStatus::Completed {
            download_url: status.report_download_url.filter(|u| !u.is_empty()),
        },
        Some("Pending") => ReportStatus::InProgress,
        other => ReportStatus::Failed(format!("report request status {}", other.unwrap_or("missing"))),
    }
}

fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Entity, Source};

    fn job() -> ReportJob {
        ReportJob::new(
            Source::Microsoft,
            Entity::AdGroup,
            "42",
            Some("AdGroupPerformanceReportRequest".to_string()),
            vec!["TimePeriod".to_string(), "Clicks".to_string()],
            "EN",
        )
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("Sandbox".parse::<Environment>().unwrap(), Environment::Sandbox);
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert!(matches!(
            "staging".parse::<Environment>(),
            Err(Error::UnknownEnvironment(_))
        ));
        assert!(Environment::Sandbox.reporting_url().contains("sandbox"));
    }

    #[test]
    fn test_submit_request_body() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 2, 3).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
        )
        .unwrap();
        let body = submit_request(&job(), &range).unwrap();
        let request = &body["ReportRequest"];

        assert_eq!(request["Type"], "AdGroupPerformanceReportRequest");
        assert_eq!(request["Aggregation"], "Daily");
        assert_eq!(request["Format"], "Csv");
        assert_eq!(request["Columns"], json!(["TimePeriod", "Clicks"]));
        assert_eq!(request["Scope"]["AccountIds"], json!([42]));
        assert_eq!(
            request["Time"]["CustomDateRangeEnd"],
            json!({"Day": 29, "Month": 2, "Year": 2024})
        );
    }

    #[test]
    fn test_poll_status_mapping() {
        let poll = |body: &str| poll_status(serde_json::from_str(body).unwrap());

        assert_eq!(
            poll(r#"{"ReportRequestStatus":{"Status":"Success","ReportDownloadUrl":"https://x/r.zip"}}"#),
            ReportStatus::Completed {
                download_url: Some("https://x/r.zip".to_string())
            }
        );
        assert_eq!(
            poll(r#"{"ReportRequestStatus":{"Status":"Success","ReportDownloadUrl":null}}"#),
            ReportStatus::Completed { download_url: None }
        );
        assert_eq!(
            poll(r#"{"ReportRequestStatus":{"Status":"Pending"}}"#),
            ReportStatus::InProgress
        );
        assert!(matches!(
            poll(r#"{"ReportRequestStatus":{"Status":"Error"}}"#),
            ReportStatus::Failed(_)
        ));
        assert!(matches!(poll("{}"), ReportStatus::Failed(_)));
    }

    #[test]
    fn test_account_ids_from_accounts_info() {
        let resp: AccountsInfoResponse = serde_json::from_str(
            r#"{"AccountsInfo":[
                {"Id":200,"Name":"B","AccountLifeCycleStatus":"Active"},
                {"Id":100,"Name":"A","AccountLifeCycleStatus":"Paused"},
                {"Name":"no id"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(account_ids(resp), vec!["100", "200"]);
    }

    #[tokio::test]
    async fn test_missing_download_url_is_empty_report() {
        let platform = MicrosoftPlatform::new(Client::new(), Environment::Sandbox, "t", "d", None);
        let mut j = job();
        j.job_id = Some("r-1".to_string());
        assert!(platform.download_report(&j).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_download_url_is_fatal() {
        let platform = MicrosoftPlatform::new(Client::new(), Environment::Sandbox, "t", "d", None);
        let mut j = job();
        j.download_url = Some("not a url".to_string());
        let err = platform.download_report(&j).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_headers_include_customer_context() {
        let platform = MicrosoftPlatform::new(Client::new(), Environment::Production, "t", "dev", Some("9"));
        let headers = platform.headers(Some("9"), Some("42")).unwrap();
        assert_eq!(headers["developertoken"], "dev");
        assert_eq!(headers["customerid"], "9");
        assert_eq!(headers["customeraccountid"], "42");
    }
}
