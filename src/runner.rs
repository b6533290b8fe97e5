use crate::auth::TokenProvider;
use crate::config::Config;
use crate::error::Error;
use crate::fields::FieldCatalog;
use crate::job::{DateRange, Source};
use crate::platform::microsoft::MicrosoftPlatform;
use crate::platform::yahoo::YahooPlatform;
use crate::platform::{ReportPlatform, USER_AGENT};
use crate::processor::ReportProcessor;
use crate::retry::{with_retry, BackoffPolicy, ExponentialBackoff};
use crate::scheduler::{build_jobs, JobScheduler, Manifest};
use crate::secrets::{EnvSecretStore, FileSecretStore, MicrosoftSecret, SecretStore, Secrets, YahooSecret};
use crate::sink::{open_store, run_timestamp, PartitionedSink};
use chrono::{NaiveDate, Utc};
use log::{error, info, warn};
use reqwest::Client;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Printed to stdout when a backfill finishes.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_ts: String,
    pub start_date: String,
    pub end_date: String,
    pub accounts: BTreeMap<Source, Vec<String>>,
    pub jobs: usize,
    pub manifest: Manifest,
}

pub async fn backfill(config: Config, start: &NaiveDate, end: &NaiveDate) -> Result<RunSummary, Error> {
    let range = DateRange::new(*start, *end)?;
    let sources = config.selected_sources();
    let entities = config.selected_entities();

    let store: Box<dyn SecretStore> = match &config.secret_env_var {
        Some(var) => Box::new(EnvSecretStore::new(var)),
        None => Box::new(FileSecretStore::new(&config.secrets_dir)),
    };
    let secrets = Secrets::load(store.as_ref(), &config.secret_id).await?;

    // Every selected source must have complete credentials before anything runs.
    let yahoo = if sources.iter().any(|s| matches!(s, Source::Search | Source::Display)) {
        Some(secrets.yahoo()?)
    } else {
        None
    };
    let microsoft = if sources.contains(&Source::Microsoft) {
        Some(secrets.microsoft()?)
    } else {
        None
    };
    let base_account_id = match &yahoo {
        Some(yahoo) => Some(
            config
                .base_account_id
                .clone()
                .or_else(|| yahoo.base_account_id.clone())
                .ok_or_else(|| Error::MissingSecretKey {
                    secret_id: config.secret_id.clone(),
                    section: "yahoo".to_string(),
                    key: "base_account_id".to_string(),
                })?,
        ),
        None => None,
    };

    let storage = secrets.storage();
    let bucket = config.bucket.clone().or(storage.bucket);
    let prefix = config.prefix.clone().or(storage.prefix).unwrap_or_default();
    let object_store = open_store(config.storage, bucket.as_deref(), &config.output_dir)?;

    let client = Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?;
    let platforms = connect(
        &client,
        &sources,
        yahoo.as_ref().zip(base_account_id.as_deref()),
        microsoft.as_ref(),
    )
    .await?;

    let backoff: Arc<dyn BackoffPolicy> = Arc::new(ExponentialBackoff::default());
    let exclusions = exclusions(yahoo.as_ref(), microsoft.as_ref());
    let accounts = discover_targets(&platforms, &exclusions, backoff.as_ref(), config.max_retries).await;
    if accounts.values().all(Vec::is_empty) {
        return Err(Error::NoTargetAccounts);
    }

    let catalog = Arc::new(FieldCatalog::embedded()?);
    let jobs = build_jobs(&catalog, &accounts, &entities, config.lang.as_str())?;
    let job_count = jobs.len();

    let run_ts = run_timestamp(Utc::now());
    info!(
        "Backfill {} -> {}: {} jobs, run_ts={}",
        range.start, range.end, job_count, run_ts
    );
    let sink = PartitionedSink::new(object_store, &prefix, &config.filename_pattern, &run_ts);
    let processor = Arc::new(ReportProcessor::new(catalog, sink));

    let scheduler = JobScheduler::new(
        platforms,
        processor,
        backoff,
        config.scheduler_config(),
        range,
    );
    let (_, manifest) = scheduler.run(jobs).await;

    Ok(RunSummary {
        run_ts,
        start_date: range.start.to_string(),
        end_date: range.end.to_string(),
        accounts,
        jobs: job_count,
        manifest,
    })
}

/// Fetches one access token per platform and builds the report clients.
async fn connect(
    client: &Client,
    sources: &[Source],
    yahoo: Option<(&YahooSecret, &str)>,
    microsoft: Option<&MicrosoftSecret>,
) -> Result<HashMap<Source, Arc<dyn ReportPlatform>>, Error> {
    let mut platforms: HashMap<Source, Arc<dyn ReportPlatform>> = HashMap::new();

    if let Some((secret, base_account_id)) = yahoo {
        let token = TokenProvider::yahoo(client.clone(), USER_AGENT)
            .get_access_token(&secret.credentials)
            .await?;
        for source in sources.iter().filter(|s| matches!(s, Source::Search | Source::Display)) {
            platforms.insert(
                *source,
                Arc::new(YahooPlatform::new(client.clone(), *source, &token, base_account_id)),
            );
        }
    }

    if let Some(secret) = microsoft {
        let token = TokenProvider::microsoft(client.clone(), USER_AGENT)
            .get_access_token(&secret.credentials)
            .await?;
        platforms.insert(
            Source::Microsoft,
            Arc::new(MicrosoftPlatform::new(
                client.clone(),
                secret.environment,
                &token,
                &secret.developer_token,
                secret.customer_id.as_deref(),
            )),
        );
    }

    Ok(platforms)
}

fn exclusions(
    yahoo: Option<&YahooSecret>,
    microsoft: Option<&MicrosoftSecret>,
) -> HashMap<Source, HashSet<String>> {
    let mut out = HashMap::new();
    if let Some(yahoo) = yahoo {
        out.insert(Source::Search, yahoo.exclude_search.iter().cloned().collect());
        out.insert(Source::Display, yahoo.exclude_display.iter().cloned().collect());
    }
    if let Some(microsoft) = microsoft {
        out.insert(Source::Microsoft, microsoft.exclude.iter().cloned().collect());
    }
    out
}

/// Lists accounts per source minus exclusions. A failed listing counts as
/// no accounts for that source.
pub async fn discover_targets(
    platforms: &HashMap<Source, Arc<dyn ReportPlatform>>,
    exclusions: &HashMap<Source, HashSet<String>>,
    backoff: &dyn BackoffPolicy,
    max_retries: u32,
) -> BTreeMap<Source, Vec<String>> {
    let mut targets = BTreeMap::new();
    for (source, platform) in platforms {
        let name = format!("list accounts ({})", source);
        let outcome = with_retry(backoff, max_retries, &name, || platform.list_accounts()).await;

        let discovered = match outcome.result {
            Ok(ids) => ids,
            Err(err) => {
                error!("Account discovery failed for {}: {}", source, err);
                Vec::new()
            }
        };

        let excluded = exclusions.get(source);
        let kept: Vec<String> = discovered
            .iter()
            .filter(|id| !excluded.is_some_and(|ex| ex.contains(*id)))
            .cloned()
            .collect();

        if kept.is_empty() {
            warn!("{}: no target accounts", source);
        } else {
            info!(
                "{}: {} accounts discovered, {} targeted",
                source,
                discovered.len(),
                kept.len()
            );
        }
        targets.insert(*source, kept);
    }
    targets
}
