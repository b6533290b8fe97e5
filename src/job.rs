use crate::error::Error;
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// A reporting API that speaks the create / poll / download protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Search,
    Display,
    Microsoft,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Search, Source::Display, Source::Microsoft];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Search => "search",
            Source::Display => "display",
            Source::Microsoft => "microsoft",
        }
    }

    /// Directory used for `entity` under the storage prefix.
    pub fn entity_dir(&self, entity: Entity) -> String {
        match self {
            Source::Search => format!("s_{}", entity),
            Source::Display => format!("d_{}", entity),
            Source::Microsoft => entity.to_string(),
        }
    }

    pub fn data_type(&self, entity: Entity) -> String {
        format!("{}_{}", self, entity)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "search" => Ok(Source::Search),
            "display" => Ok(Source::Display),
            "microsoft" | "ms" => Ok(Source::Microsoft),
            other => Err(Error::UnknownSource(other.to_string())),
        }
    }
}

/// Granularity of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Account,
    Campaign,
    AdGroup,
    #[serde(rename = "adgroupad")]
    Ad,
}

impl Entity {
    pub const ALL: [Entity; 4] = [Entity::Account, Entity::Campaign, Entity::AdGroup, Entity::Ad];

    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Account => "account",
            Entity::Campaign => "campaign",
            Entity::AdGroup => "adgroup",
            Entity::Ad => "adgroupad",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Entity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "account" => Ok(Entity::Account),
            "campaign" => Ok(Entity::Campaign),
            "adgroup" => Ok(Entity::AdGroup),
            "adgroupad" | "ad" => Ok(Entity::Ad),
            other => Err(Error::UnknownEntity(other.to_string())),
        }
    }
}

/// Inclusive reporting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, Error> {
        if start > end {
            return Err(Error::StartDateAfterEndDate {
                start_date: start.to_string(),
                end_date: end.to_string(),
            });
        }
        Ok(Self { start, end })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Added,
    Running,
    Completed,
    Downloaded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Downloaded | JobStatus::Failed | JobStatus::Skipped)
    }

    /// Position along the happy path; terminal failure states sit past it.
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Added => 1,
            JobStatus::Running => 2,
            JobStatus::Completed => 3,
            JobStatus::Downloaded | JobStatus::Failed | JobStatus::Skipped => 4,
        }
    }

    /// Statuses only move forward, and never out of a terminal state.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobStatus::Failed => true,
            JobStatus::Skipped => *self == JobStatus::Pending,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Added => "ADDED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Downloaded => "DOWNLOADED",
            JobStatus::Failed => "FAILED",
            JobStatus::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// One (source, entity, account, period) unit of work.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportJob {
    pub source: Source,
    pub entity: Entity,
    pub account_id: String,
    pub report_type: Option<String>,
    fields: Vec<String>,
    pub language: String,
    pub job_id: Option<String>,
    /// Where the finished report can be fetched, when the platform hands out a URL.
    pub download_url: Option<String>,
    status: JobStatus,
    pub attempts_add: u32,
    pub attempts_status: u32,
    pub attempts_download: u32,
    pub error: Option<String>,
}

impl ReportJob {
    pub fn new(
        source: Source,
        entity: Entity,
        account_id: impl Into<String>,
        report_type: Option<String>,
        fields: Vec<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            source,
            entity,
            account_id: account_id.into(),
            report_type,
            fields,
            language: language.into(),
            job_id: None,
            download_url: None,
            status: JobStatus::Pending,
            attempts_add: 0,
            attempts_status: 0,
            attempts_download: 0,
            error: None,
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Moves the job to `next`, refusing backward or post-terminal moves.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if !self.advance(JobStatus::Failed) {
            return false;
        }
        self.error = Some(message.into());
        true
    }

    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.source, self.entity, self.account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ReportJob {
        ReportJob::new(
            Source::Search,
            Entity::Campaign,
            "1001",
            Some("CAMPAIGN".to_string()),
            vec!["DAY".to_string()],
            "EN",
        )
    }

    #[test]
    fn test_happy_path_moves_forward() {
        let mut j = job();
        for next in [
            JobStatus::Added,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Downloaded,
        ] {
            assert!(j.advance(next), "{} -> {}", j.status(), next);
        }
        assert!(j.status().is_terminal());
    }

    #[test]
    fn test_backward_and_skipping_moves_are_refused() {
        let mut j = job();
        assert!(!j.advance(JobStatus::Running));
        assert!(j.advance(JobStatus::Added));
        assert!(!j.advance(JobStatus::Pending));
        assert!(j.advance(JobStatus::Running));
        assert!(!j.advance(JobStatus::Added));
        assert!(!j.advance(JobStatus::Skipped));
        assert_eq!(j.status(), JobStatus::Running);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut j = job();
        assert!(j.fail("Timeout"));
        assert!(!j.advance(JobStatus::Added));
        assert!(!j.fail("again"));
        assert_eq!(j.error.as_deref(), Some("Timeout"));

        let mut skipped = job();
        assert!(skipped.advance(JobStatus::Skipped));
        assert!(!skipped.advance(JobStatus::Failed));
    }

    #[test]
    fn test_entity_and_source_parsing() {
        assert_eq!("ad".parse::<Entity>().unwrap(), Entity::Ad);
        assert_eq!(" AdGroupAd ".parse::<Entity>().unwrap(), Entity::Ad);
        assert_eq!("display".parse::<Source>().unwrap(), Source::Display);
        assert!(matches!("google".parse::<Source>(), Err(Error::UnknownSource(_))));
        assert!(matches!("keyword".parse::<Entity>(), Err(Error::UnknownEntity(_))));
    }

    #[test]
    fn test_storage_naming() {
        assert_eq!(Source::Search.entity_dir(Entity::Account), "s_account");
        assert_eq!(Source::Display.entity_dir(Entity::Ad), "d_adgroupad");
        assert_eq!(Source::Microsoft.entity_dir(Entity::AdGroup), "adgroup");
        assert_eq!(Source::Display.data_type(Entity::Campaign), "display_campaign");
    }

    #[test]
    fn test_date_range_rejects_inverted_period() {
        let start = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(matches!(
            DateRange::new(start, end),
            Err(Error::StartDateAfterEndDate { .. })
        ));
        assert!(DateRange::new(end, start).is_ok());
    }
}
