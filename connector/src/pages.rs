use futures::stream::{self, StreamExt, TryStreamExt};
use metrics::{counter, histogram};
use tracing::{debug, info};

use connector_core::Result;

use crate::client::QueryApi;
use crate::model::{QuerySpec, Row};

/// Row offsets for a result of `total` rows in pages of `page_size`:
/// exactly `ceil(total / page_size)` of them, ascending, stride `page_size`.
pub fn page_offsets(total: u64, page_size: u64) -> Vec<u64> {
    if page_size == 0 {
        return Vec::new();
    }
    (0..total.div_ceil(page_size))
        .map(|i| i * page_size)
        .collect()
}

/// Collects a complete query result.
///
/// One probe request at offset 0 supplies the total row count; the probe
/// reply's rows are not used, page 0 is fetched again with the rest. All
/// pages then fan out concurrently (bounded by `max_concurrent`) and are
/// reassembled in ascending offset order no matter when each reply lands.
/// Any page failing after its own retries rejects the whole collection.
pub async fn collect_all(
    api: &dyn QueryApi,
    spec: &QuerySpec,
    max_concurrent: usize,
) -> Result<Vec<Row>> {
    let probe = api.fetch_page(spec, 0).await?;
    let total = probe.total;

    if total == 0 {
        debug!(dataset = %spec.dataset, "query matched no rows");
        return Ok(Vec::new());
    }

    let offsets = page_offsets(total, spec.page_size.max(1));
    let page_count = offsets.len();
    debug!(
        dataset = %spec.dataset,
        total,
        pages = page_count,
        "fanning out page requests"
    );

    let pages = stream::iter(offsets)
        .map(|offset| api.fetch_page(spec, offset))
        .buffered(max_concurrent.max(1))
        .try_collect::<Vec<_>>()
        .await?;

    let rows: Vec<Row> = pages.into_iter().flat_map(|page| page.values).collect();

    counter!("connector_pages_fetched", "dataset" => spec.dataset.clone())
        .increment(page_count as u64);
    histogram!("connector_rows_collected", "dataset" => spec.dataset.clone())
        .record(rows.len() as f64);
    info!(dataset = %spec.dataset, rows = rows.len(), pages = page_count, "collection complete");

    Ok(rows)
}
