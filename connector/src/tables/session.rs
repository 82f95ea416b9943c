use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use metrics::counter;
use tokio::sync::OnceCell;
use tracing::debug;

use connector_core::{Error, Result};

use crate::client::QueryApi;
use crate::model::{DateRange, QuerySpec, Row};
use crate::pages;
use crate::periods::{self, ResolvedPeriods};

use super::{Table, TableRegistry, TableRows};

type TableOutcome = std::result::Result<TableRows, Arc<Error>>;

/// What a table fetcher gets to work with: the query API, the extraction
/// window, and the session-wide period cache.
pub struct FetchContext {
    api: Arc<dyn QueryApi>,
    range: Option<DateRange>,
    periods: OnceCell<ResolvedPeriods>,
    max_concurrent_pages: usize,
}

impl FetchContext {
    pub fn new(api: Arc<dyn QueryApi>, range: Option<DateRange>, max_concurrent_pages: usize) -> Self {
        Self {
            api,
            range,
            periods: OnceCell::new(),
            max_concurrent_pages,
        }
    }

    pub fn api(&self) -> &dyn QueryApi {
        self.api.as_ref()
    }

    /// The period tokens for the session's window. Resolved on first use,
    /// then cached; concurrent first callers share one resolution.
    pub async fn periods(&self) -> Result<&ResolvedPeriods> {
        self.periods
            .get_or_try_init(|| async {
                let range = self.range.as_ref().ok_or_else(|| {
                    Error::Config(
                        "an extraction window (start and end dates) is required for time-bounded tables"
                            .into(),
                    )
                })?;
                periods::resolve(self.api.as_ref(), range).await
            })
            .await
    }

    /// Full paginated collection for one query under the session's
    /// concurrency limit.
    pub async fn collect(&self, spec: &QuerySpec) -> Result<Vec<Row>> {
        pages::collect_all(self.api.as_ref(), spec, self.max_concurrent_pages).await
    }
}

/// One extraction session: each registered table gets a single-assignment
/// cell that records its settled outcome, success or failure. The first
/// request for an id claims the cell before the fetch settles, so duplicate
/// and concurrent requests share one attempt, and later requests observe
/// the cached outcome without refetching.
pub struct TableSession {
    registry: Arc<TableRegistry>,
    ctx: FetchContext,
    cells: HashMap<String, OnceCell<TableOutcome>>,
    increments: HashMap<String, String>,
}

impl TableSession {
    /// Validates the registry (dependency existence, acyclicity) before any
    /// fetch can begin.
    pub fn new(
        registry: Arc<TableRegistry>,
        ctx: FetchContext,
        increments: HashMap<String, String>,
    ) -> Result<Self> {
        registry.validate()?;
        let cells = registry
            .ids()
            .map(|id| (id.to_string(), OnceCell::new()))
            .collect();
        Ok(Self {
            registry,
            ctx,
            cells,
            increments,
        })
    }

    pub fn context(&self) -> &FetchContext {
        &self.ctx
    }

    /// Resolve one table, fetching it and any missing dependencies.
    /// An id that was never registered fails immediately, before any fetch.
    pub async fn get_table(&self, id: &str) -> Result<TableRows> {
        self.get_table_inner(id).await
    }

    fn get_table_inner<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<TableRows>> {
        async move {
            let cell = self
                .cells
                .get(id)
                .ok_or_else(|| Error::Config(format!("unknown table '{id}'")))?;

            let outcome = cell.get_or_init(|| self.resolve(id)).await;
            match outcome {
                Ok(rows) => Ok(rows.clone()),
                Err(cause) => Err(Error::Table {
                    id: id.to_string(),
                    cause: cause.clone(),
                }),
            }
        }
        .boxed()
    }

    async fn resolve(&self, id: &str) -> TableOutcome {
        match self.fetch_table(id).await {
            Ok(rows) => {
                debug!(table = id, rows = rows.len(), "table resolved");
                Ok(Arc::new(rows))
            }
            Err(e) => {
                counter!("connector_table_failures", "table" => id.to_string()).increment(1);
                Err(Arc::new(e))
            }
        }
    }

    async fn fetch_table(&self, id: &str) -> Result<Vec<Row>> {
        let table = self
            .registry
            .get(id)
            .ok_or_else(|| Error::Config(format!("unknown table '{id}'")))?
            .clone();

        // Dependencies all settle (none are abandoned mid-flight); the
        // first failure in declaration order wins.
        let settled =
            future::join_all(table.depends_on().iter().map(|dep| self.get_table_inner(dep)))
                .await;
        let mut deps = Vec::with_capacity(settled.len());
        for result in settled {
            deps.push(result?);
        }

        debug!(table = id, deps = deps.len(), "dependencies ready, fetching");
        let increment = self.increments.get(id).map(String::as_str);
        let rows = table.fetch(&self.ctx, increment, &deps).await?;
        table.post_process(rows)
    }
}
