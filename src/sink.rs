use crate::config::StorageKind;
use crate::error::Error;
use crate::job::{Entity, Source};
use crate::parser::DATE_KEY;
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use datafusion::arrow::array::{Array, ArrayRef, AsArray, Date32Array, RecordBatch};
use datafusion::arrow::compute::{filter_record_batch, is_not_null};
use datafusion::arrow::datatypes::{DataType, Date32Type, Field, Schema};
use datafusion::common::ScalarValue;
use datafusion::parquet::arrow::ArrowWriter;
use datafusion::prelude::{col, lit, DataFrame, SessionContext};
use log::{debug, info, warn};
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;

pub const INGESTION_TIMESTAMP: &str = "_ingestion_timestamp";
pub const DEFAULT_FILENAME_PATTERN: &str = "{dataType}_{accountId}_{date}_{run_ts}.parq";

const DATE_FORMATS: [&str; 3] = ["%Y%m%d", "%Y-%m-%d", "%Y/%m/%d"];
const JST_OFFSET_SECS: i32 = 9 * 3600;

/// Opens the destination store for a run.
pub fn open_store(
    kind: StorageKind,
    bucket: Option<&str>,
    output_dir: &str,
) -> Result<Arc<dyn ObjectStore>, Error> {
    let require_bucket = || {
        bucket
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::StorageConfig(format!("{:?} storage needs a bucket", kind)))
    };

    let store: Arc<dyn ObjectStore> = match kind {
        StorageKind::S3 => Arc::new(
            object_store::aws::AmazonS3Builder::from_env()
                .with_bucket_name(require_bucket()?)
                .build()?,
        ),
        StorageKind::Gcs => Arc::new(
            object_store::gcp::GoogleCloudStorageBuilder::from_env()
                .with_bucket_name(require_bucket()?)
                .build()?,
        ),
        StorageKind::Local => {
            std::fs::create_dir_all(output_dir)?;
            Arc::new(object_store::local::LocalFileSystem::new_with_prefix(
                output_dir,
            )?)
        }
    };
    Ok(store)
}

/// `YYYYMMDDHHMMSS` in Japan time, shared by every object of a run.
pub fn run_timestamp(now: DateTime<Utc>) -> String {
    let jst = FixedOffset::east_opt(JST_OFFSET_SECS).unwrap_or_else(|| Utc.fix());
    now.with_timezone(&jst).format("%Y%m%d%H%M%S").to_string()
}

/// Parses the date formats the platforms emit; datetimes keep only their day.
pub fn parse_report_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    let day = value.get(..10).filter(|d| d.contains(['-', '/'])).unwrap_or(value);
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(day, fmt).ok())
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    (date - DateTime::<Utc>::UNIX_EPOCH.date_naive()).num_days() as i32
}

fn render_filename(pattern: &str, data_type: &str, account_id: &str, ymd: &str, run_ts: &str) -> String {
    pattern
        .replace("{dataType}", data_type)
        .replace("{accountId}", account_id)
        .replace("{date}", ymd)
        .replace("{run_ts}", run_ts)
}

/// Raw date columns made redundant by the normalized `date`.
fn redundant_date_columns(source: Source) -> &'static [&'static str] {
    match source {
        Source::Search | Source::Display => &["Day", "Daily"],
        Source::Microsoft => &[],
    }
}

/// Writes one Parquet object per (source, entity, account, day).
#[derive(Clone)]
pub struct PartitionedSink {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    filename_pattern: String,
    run_ts: String,
}

impl PartitionedSink {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: &str,
        filename_pattern: &str,
        run_ts: &str,
    ) -> Self {
        PartitionedSink {
            store,
            prefix: prefix.trim_matches('/').to_string(),
            filename_pattern: filename_pattern.to_string(),
            run_ts: run_ts.to_string(),
        }
    }

    pub fn object_key(&self, source: Source, entity: Entity, account_id: &str, ymd: &str) -> String {
        let filename = render_filename(
            &self.filename_pattern,
            &source.data_type(entity),
            account_id,
            ymd,
            &self.run_ts,
        );
        let tail = format!(
            "{}/{}/{}/{}/{}",
            source.entity_dir(entity),
            account_id,
            ymd,
            self.run_ts,
            filename
        );
        if self.prefix.is_empty() {
            tail
        } else {
            format!("{}/{}", self.prefix, tail)
        }
    }

    /// Splits `df` by calendar day and uploads each day.
    ///
    /// Returns the number of rows uploaded. Zero means the frame was empty or
    /// had no usable dates, i.e. no data for this period.
    pub async fn write(
        &self,
        df: DataFrame,
        account_id: &str,
        entity: Entity,
        source: Source,
    ) -> Result<usize, Error> {
        let label = format!("{}/{}/{}", source, entity, account_id);
        if df.schema().field_with_unqualified_name(DATE_KEY).is_err() {
            warn!("{}: no '{}' column, nothing to write", label, DATE_KEY);
            return Ok(0);
        }

        let mut dated = Vec::new();
        for batch in df.collect().await? {
            let batch = with_parsed_dates(&batch, redundant_date_columns(source))?;
            if batch.num_rows() > 0 {
                dated.push(batch);
            }
        }
        if dated.is_empty() {
            warn!("{}: no rows with a valid date for this period", label);
            return Ok(0);
        }

        let ctx = SessionContext::new();
        let df = ctx.read_batches(dated)?;

        let distinct_days = df
            .clone()
            .select(vec![col(DATE_KEY)])?
            .distinct()?
            .sort(vec![col(DATE_KEY).sort(true, false)])?
            .collect()
            .await?;

        let mut written = 0;
        for batch in distinct_days {
            let column = batch.column(0).as_primitive::<Date32Type>();
            for days in column.iter().flatten() {
                let date = DateTime::<Utc>::UNIX_EPOCH.date_naive() + chrono::Duration::days(days as i64);
                let ymd = date.format("%Y%m%d").to_string();

                let ingested_at = Utc::now().timestamp_micros();
                let part = df
                    .clone()
                    .filter(col(DATE_KEY).eq(lit(ScalarValue::Date32(Some(days)))))?
                    .with_column(
                        INGESTION_TIMESTAMP,
                        lit(ScalarValue::TimestampMicrosecond(
                            Some(ingested_at),
                            Some(Arc::from("UTC")),
                        )),
                    )?;

                let key = self.object_key(source, entity, account_id, &ymd);
                let (body, rows) = encode_parquet(part).await?;
                debug!("{}: uploading {} rows ({} bytes) to {}", label, rows, body.len(), key);
                self.store
                    .put(&Path::parse(&key)?, PutPayload::from(body))
                    .await?;
                info!("Put {}", key);
                written += rows;
            }
        }

        Ok(written)
    }
}

/// Replaces the text `date` column with a `Date32` column placed first,
/// drops rows whose date does not parse and drops `redundant` columns.
fn with_parsed_dates(batch: &RecordBatch, redundant: &[&str]) -> Result<RecordBatch, Error> {
    let schema = batch.schema();
    let idx = schema.index_of(DATE_KEY)?;

    let raw = batch.column(idx);
    let dates: Date32Array = match raw.as_string_opt::<i32>() {
        Some(strings) => strings
            .iter()
            .map(|v| v.and_then(parse_report_date).map(days_since_epoch))
            .collect(),
        None if raw.data_type() == &DataType::Date32 => raw.as_primitive::<Date32Type>().clone(),
        None => {
            return Err(Error::ReportParse(format!(
                "unsupported date column type {}",
                raw.data_type()
            )))
        }
    };

    let mut fields = vec![Field::new(DATE_KEY, DataType::Date32, true)];
    let mut columns: Vec<ArrayRef> = vec![Arc::new(dates.clone())];
    for (i, field) in schema.fields().iter().enumerate() {
        if i == idx || redundant.contains(&field.name().as_str()) {
            continue;
        }
        fields.push(field.as_ref().clone());
        columns.push(batch.column(i).clone());
    }

    let reordered = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?;
    let valid = is_not_null(&dates)?;
    Ok(filter_record_batch(&reordered, &valid)?)
}

/// Encodes `df` as one Parquet file, returning the bytes and the row count.
async fn encode_parquet(df: DataFrame) -> Result<(Vec<u8>, usize), Error> {
    let schema = Arc::new(df.schema().as_arrow().clone());
    let batches = df.collect().await?;

    let mut buf = Vec::new();
    let mut rows = 0;
    let mut writer = ArrowWriter::try_new(&mut buf, schema, None)?;
    for batch in &batches {
        writer.write(batch)?;
        rows += batch.num_rows();
    }
    writer.close()?;
    Ok((buf, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caster::rows_to_batch;
    use crate::parser::ReportParser;
    use chrono::TimeZone;
    use datafusion::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use futures_util::TryStreamExt;
    use object_store::memory::InMemory;

    fn sink(store: Arc<dyn ObjectStore>) -> PartitionedSink {
        PartitionedSink::new(store, "/yahoo/", DEFAULT_FILENAME_PATTERN, "20240301120000")
    }

    fn frame(csv: &str) -> DataFrame {
        let report = ReportParser::default().parse(csv.as_bytes()).unwrap();
        let batch = rows_to_batch(&report).unwrap();
        SessionContext::new().read_batch(batch).unwrap()
    }

    async fn read_back(store: &InMemory, key: &Path) -> Vec<RecordBatch> {
        let bytes = store.get(key).await.unwrap().bytes().await.unwrap();
        ParquetRecordBatchReaderBuilder::try_new(bytes)
            .unwrap()
            .build()
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_object_key_layout() {
        let s = sink(Arc::new(InMemory::new()));
        assert_eq!(
            s.object_key(Source::Search, Entity::Campaign, "1001", "20240105"),
            "yahoo/s_campaign/1001/20240105/20240301120000/search_campaign_1001_20240105_20240301120000.parq"
        );
    }

    #[test]
    fn test_run_timestamp_is_japan_time() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 20, 30, 5).unwrap();
        assert_eq!(run_timestamp(now), "20240302053005");
    }

    #[test]
    fn test_parse_report_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 9);
        assert_eq!(parse_report_date("20240109"), expected);
        assert_eq!(parse_report_date("2024-01-09"), expected);
        assert_eq!(parse_report_date("2024/01/09"), expected);
        assert_eq!(parse_report_date("2024-01-09T00:00:00"), expected);
        assert_eq!(parse_report_date("Total"), None);
    }

    #[tokio::test]
    async fn test_empty_frame_writes_nothing() {
        let store = Arc::new(InMemory::new());
        let df = frame("Day,Clicks\n");

        let wrote = sink(store.clone())
            .write(df, "1001", Entity::Account, Source::Search)
            .await
            .unwrap();

        assert_eq!(wrote, 0);
        let objects: Vec<_> = store.list(None).try_collect().await.unwrap();
        assert!(objects.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_dates_write_nothing() {
        let store = Arc::new(InMemory::new());
        let df = frame("Day,Clicks\nyesterday,5\n");

        let wrote = sink(store.clone())
            .write(df, "1001", Entity::Account, Source::Search)
            .await
            .unwrap();
        assert_eq!(wrote, 0);
    }

    #[tokio::test]
    async fn test_one_object_per_distinct_day() {
        let store = Arc::new(InMemory::new());
        let df = frame(
            "Day,Clicks\n20240101,5\n20240102,7\n20240101,1\n20240103,2\nnot-a-date,9\n",
        );

        let wrote = sink(store.clone())
            .write(df, "1001", Entity::Account, Source::Search)
            .await
            .unwrap();
        // The undated row is dropped and not counted.
        assert_eq!(wrote, 4);

        let mut objects: Vec<_> = store.list(None).try_collect().await.unwrap();
        objects.sort_by(|a, b| a.location.cmp(&b.location));
        assert_eq!(objects.len(), 3);

        let expected = [("20240101", 2), ("20240102", 1), ("20240103", 1)];
        for (meta, (ymd, rows)) in objects.iter().zip(expected) {
            assert!(meta.location.as_ref().contains(&format!("/{}/", ymd)));

            let batches = read_back(&store, &meta.location).await;
            let total: usize = batches.iter().map(|b| b.num_rows()).sum();
            assert_eq!(total, rows);

            for batch in &batches {
                let schema = batch.schema();
                assert_eq!(schema.field(0).name(), DATE_KEY);
                assert!(schema.index_of("Day").is_err());
                assert_eq!(
                    schema.fields().last().unwrap().name(),
                    INGESTION_TIMESTAMP
                );

                let dates = batch.column(0).as_primitive::<Date32Type>();
                let day = parse_report_date(ymd).map(days_since_epoch).unwrap();
                assert!(dates.iter().all(|d| d == Some(day)));
            }
        }
    }

    #[tokio::test]
    async fn test_microsoft_keeps_time_period_column() {
        let store = Arc::new(InMemory::new());
        let df = frame("TimePeriod,Clicks\n2024-01-01,3\n");

        let wrote = PartitionedSink::new(store.clone(), "ms", DEFAULT_FILENAME_PATTERN, "20240301000000")
            .write(df, "42", Entity::Ad, Source::Microsoft)
            .await
            .unwrap();
        assert_eq!(wrote, 1);

        let key = Path::parse(
            "ms/adgroupad/42/20240101/20240301000000/microsoft_adgroupad_42_20240101_20240301000000.parq",
        )
        .unwrap();
        let batches = read_back(&store, &key).await;
        assert!(batches[0].schema().index_of("TimePeriod").is_ok());
    }

    #[test]
    fn test_local_store_requires_no_bucket() {
        let dir = tempfile::TempDir::new().unwrap();
        let output = dir.path().join("out");
        let store = open_store(StorageKind::Local, None, output.to_str().unwrap());
        assert!(store.is_ok());
        assert!(output.exists());

        assert!(matches!(
            open_store(StorageKind::S3, None, "unused"),
            Err(Error::StorageConfig(_))
        ));
    }
}
