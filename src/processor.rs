use crate::caster::{cast, rows_to_batch};
use crate::error::Error;
use crate::fields::FieldCatalog;
use crate::job::ReportJob;
use crate::parser::ReportParser;
use crate::sink::PartitionedSink;
use datafusion::prelude::SessionContext;
use log::info;
use std::sync::Arc;

/// Turns a downloaded report body into stored partitions.
pub struct ReportProcessor {
    parser: ReportParser,
    catalog: Arc<FieldCatalog>,
    sink: PartitionedSink,
}

impl ReportProcessor {
    pub fn new(catalog: Arc<FieldCatalog>, sink: PartitionedSink) -> Self {
        ReportProcessor {
            parser: ReportParser::default(),
            catalog,
            sink,
        }
    }

    /// Returns the number of rows written; zero means no data for the period.
    pub async fn process(&self, job: &ReportJob, body: &[u8]) -> Result<usize, Error> {
        let report = self.parser.parse(body)?;
        if report.is_empty() {
            info!("{}: no data for this period", job.label());
            return Ok(0);
        }

        let types = self.catalog.get(job.source, job.entity)?.type_table();
        let batch = cast(&rows_to_batch(&report)?, &types)?;

        let ctx = SessionContext::new();
        let df = ctx.read_batch(batch)?;
        let rows = self
            .sink
            .write(df, &job.account_id, job.entity, job.source)
            .await?;

        if rows > 0 {
            info!("{}: wrote {} of {} parsed rows", job.label(), rows, report.rows.len());
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Entity, Source};
    use crate::sink::DEFAULT_FILENAME_PATTERN;
    use futures_util::TryStreamExt;
    use object_store::memory::InMemory;
    use object_store::ObjectStore;

    fn processor(store: Arc<InMemory>) -> ReportProcessor {
        let sink = PartitionedSink::new(store, "raw", DEFAULT_FILENAME_PATTERN, "20240301000000");
        ReportProcessor::new(Arc::new(FieldCatalog::embedded().unwrap()), sink)
    }

    fn job() -> ReportJob {
        ReportJob::new(Source::Search, Entity::Account, "1001", None, vec![], "EN")
    }

    #[tokio::test]
    async fn test_report_rows_are_written() {
        let store = Arc::new(InMemory::new());
        let rows = processor(store.clone())
            .process(&job(), b"Report\nDay,Clicks,Cost\n20240101,5,10\n20240102,1,2\nTotal,6,12\n")
            .await
            .unwrap();

        assert_eq!(rows, 2);
        let objects: Vec<_> = store.list(None).try_collect().await.unwrap();
        assert_eq!(objects.len(), 2);
    }

    #[tokio::test]
    async fn test_rows_without_a_date_are_not_counted() {
        let store = Arc::new(InMemory::new());
        let rows = processor(store.clone())
            .process(&job(), b"Day,Clicks,Cost\n20240101,5,10\nlater,1,2\n20240103,2,4\n")
            .await
            .unwrap();

        assert_eq!(rows, 2);
        let objects: Vec<_> = store.list(None).try_collect().await.unwrap();
        assert_eq!(objects.len(), 2);
    }

    #[tokio::test]
    async fn test_header_only_report_writes_nothing() {
        let store = Arc::new(InMemory::new());
        let rows = processor(store.clone())
            .process(&job(), b"Day,Clicks\n")
            .await
            .unwrap();

        assert_eq!(rows, 0);
        let objects: Vec<_> = store.list(None).try_collect().await.unwrap();
        assert!(objects.is_empty());
    }
}
