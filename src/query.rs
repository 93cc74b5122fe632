use std::cmp::Ordering;

use crate::error::StoreError;
use crate::log_store::N_MAX;
use crate::source::SourceId;
use crate::state::Storage;
use crate::types::{EventRecord, SourceSummary, Summary};

/// Newest-first page of up to `N_MAX` records. Unknown sources give an
/// empty page.
pub async fn get_page(storage: &Storage, source: &SourceId) -> Result<Vec<EventRecord>, StoreError> {
    storage.log.read(source, N_MAX).await
}

/// Event count and latest timestamp for every registered source.
pub async fn get_summary(storage: &Storage) -> Result<Summary, StoreError> {
    let mut sources = Vec::new();
    for raw in storage.registry.list().await? {
        // Older writers registered raw route strings; ones that are not
        // valid ids have no log we can address.
        let source = match SourceId::parse(&raw) {
            Ok(source) => source,
            Err(_) => continue,
        };
        let event_count = storage.log.count(&source).await?;
        let most_recent = storage
            .log
            .head(&source)
            .await?
            .filter(|record| record.diagnostic.is_none())
            .map(|record| record.received_at);
        sources.push(SourceSummary {
            source_id: raw,
            event_count,
            most_recent,
        });
    }

    sort_summaries(&mut sources);
    let total_events = sources.iter().map(|s| s.event_count).sum();
    Ok(Summary {
        total_sources: sources.len(),
        total_events,
        sources,
    })
}

/// Most recent first; sources without a timestamp last; ties by id.
fn sort_summaries(sources: &mut [SourceSummary]) {
    sources.sort_by(|a, b| match (a.most_recent, b.most_recent) {
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| a.source_id.cmp(&b.source_id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.source_id.cmp(&b.source_id),
    });
}
