use crate::job::{Entity, Source};
use crate::scheduler::SchedulerConfig;
use crate::sink::DEFAULT_FILENAME_PATTERN;
use clap::{Args as ClapArgs, ValueEnum};
use std::time::Duration;

const DEFAULT_SECRET_ID: &str = "ads-report-extractor";
const SECRETS_DIR: &str = "./secrets";
const DEFAULT_SOURCES: &str = "search,display,microsoft";
const DEFAULT_ENTITIES: &str = "account,campaign,adgroup,adgroupad";
const OUTPUT_DIR: &str = "./output";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    S3,
    Gcs,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Language {
    En,
    Ja,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::En => "EN",
            Language::Ja => "JA",
        }
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct Config {
    #[arg(long, default_value = DEFAULT_SECRET_ID, env = "SECRET_ID")]
    pub(crate) secret_id: String,

    /// Directory holding `{secret_id}.json`.
    #[arg(long, default_value = SECRETS_DIR, env = "SECRETS_DIR")]
    pub(crate) secrets_dir: String,

    /// Read the secret JSON from this environment variable instead of a file.
    #[arg(long, env = "SECRET_ENV_VAR")]
    pub(crate) secret_env_var: Option<String>,

    #[arg(long, default_value = DEFAULT_SOURCES, value_delimiter = ',', env = "SOURCES")]
    pub(crate) sources: Vec<Source>,

    #[arg(long, default_value = DEFAULT_ENTITIES, value_delimiter = ',', env = "ENTITIES")]
    pub(crate) entities: Vec<Entity>,

    #[arg(long, value_enum, ignore_case = true, default_value = "en", env = "REPORT_LANGUAGE")]
    pub(crate) lang: Language,

    /// Overrides the Yahoo base (MCC) account from the secret.
    #[arg(long, env = "BASE_ACCOUNT_ID")]
    pub(crate) base_account_id: Option<String>,

    #[arg(long, value_enum, default_value = "s3", env = "STORAGE")]
    pub(crate) storage: StorageKind,

    /// Overrides the bucket from the secret.
    #[arg(long, env = "BUCKET")]
    pub(crate) bucket: Option<String>,

    /// Overrides the key prefix from the secret.
    #[arg(long, env = "PREFIX")]
    pub(crate) prefix: Option<String>,

    #[arg(long, default_value = OUTPUT_DIR, env = "OUTPUT_DIR")]
    pub(crate) output_dir: String,

    #[arg(long, default_value = DEFAULT_FILENAME_PATTERN, env = "FILENAME_PATTERN")]
    pub(crate) filename_pattern: String,

    #[arg(long, default_value_t = 10, env = "MAX_WORKERS")]
    pub(crate) max_workers: usize,

    /// Seconds between status polls of one report.
    #[arg(long, default_value_t = 1.2, env = "POLL_INTERVAL")]
    pub(crate) poll_interval: f64,

    #[arg(long, default_value_t = 7, env = "MAX_RETRIES")]
    pub(crate) max_retries: u32,

    #[arg(long, default_value_t = 3, env = "ADD_LIMIT_PER_SOURCE")]
    pub(crate) add_limit_per_source: usize,

    /// Wall-clock budget for the whole run, in seconds.
    #[arg(long, default_value_t = 3600, env = "OVERALL_TIMEOUT")]
    pub(crate) overall_timeout: u64,

    #[arg(short, long, env = "VERBOSE")]
    pub(crate) verbose: bool,
}

impl Config {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_workers: self.max_workers.max(1),
            poll_interval: Duration::try_from_secs_f64(self.poll_interval).unwrap_or_default(),
            max_retries: self.max_retries,
            add_limit_per_source: self.add_limit_per_source.max(1),
            overall_timeout: Duration::from_secs(self.overall_timeout),
        }
    }

    /// Selected sources in a stable order without duplicates.
    pub fn selected_sources(&self) -> Vec<Source> {
        let mut sources = self.sources.clone();
        sources.sort();
        sources.dedup();
        sources
    }

    pub fn selected_entities(&self) -> Vec<Entity> {
        let mut entities = self.entities.clone();
        entities.sort();
        entities.dedup();
        entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestArgs {
        #[command(flatten)]
        config: Config,
    }

    fn parse(args: &[&str]) -> Config {
        TestArgs::try_parse_from(std::iter::once("test").chain(args.iter().copied()))
            .unwrap()
            .config
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.selected_sources(), Source::ALL.to_vec());
        assert_eq!(config.selected_entities(), Entity::ALL.to_vec());
        assert_eq!(config.lang, Language::En);
        assert_eq!(config.storage, StorageKind::S3);

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.max_workers, 10);
        assert_eq!(scheduler.poll_interval, Duration::from_millis(1200));
        assert_eq!(scheduler.max_retries, 7);
        assert_eq!(scheduler.add_limit_per_source, 3);
        assert_eq!(scheduler.overall_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn test_lists_and_aliases() {
        let config = parse(&[
            "--sources",
            "ms,search,search",
            "--entities",
            "ad,account",
            "--lang",
            "JA",
            "--storage",
            "local",
        ]);
        assert_eq!(config.selected_sources(), vec![Source::Search, Source::Microsoft]);
        assert_eq!(config.selected_entities(), vec![Entity::Account, Entity::Ad]);
        assert_eq!(config.lang.as_str(), "JA");
        assert_eq!(config.storage, StorageKind::Local);
    }

    #[test]
    fn test_unknown_entity_is_rejected() {
        let result = TestArgs::try_parse_from(["test", "--entities", "keyword"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_negative_poll_interval_becomes_zero() {
        let config = parse(&["--poll-interval=-1", "--max-workers", "0"]);
        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.poll_interval, Duration::ZERO);
        assert_eq!(scheduler.max_workers, 1);
    }
}
