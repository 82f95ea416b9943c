use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use tracing::{error, info, instrument};

use connector_core::config::FailureMode;
use connector_core::{Config, Error, Result};

use crate::client::QueryClient;
use crate::datasets;
use crate::model::DateRange;
use crate::tables::{FetchContext, TableRegistry, TableSession};

/// One extraction run: validated registry, authenticated client, and a
/// fresh session whose caches live exactly as long as the run.
pub struct App {
    config: Config,
    registry: Arc<TableRegistry>,
    session: TableSession,
}

impl App {
    #[instrument(skip(config))]
    pub fn new(config: Config) -> Result<Self> {
        info!("Initializing extraction session");

        if config.api.account_id.is_empty() {
            return Err(Error::Config("api.account_id is required".into()));
        }
        if config.api.username.is_empty() {
            return Err(Error::Config("api.username is required".into()));
        }

        let client = QueryClient::new(
            &config.api,
            config.retry.query.clone(),
            config.retry.periods.clone(),
        )?;

        let mut registry = TableRegistry::new();
        datasets::register_builtin(&mut registry, config.extract.page_size)?;
        let registry = Arc::new(registry);

        let range = match (config.extract.start_date, config.extract.end_date) {
            (Some(start), Some(end)) => Some(DateRange::new(start, end)?),
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "extract.start_date and extract.end_date must be set together".into(),
                ))
            }
        };

        let ctx = FetchContext::new(
            Arc::new(client),
            range,
            config.extract.max_concurrent_pages,
        );
        let session = TableSession::new(Arc::clone(&registry), ctx, HashMap::new())?;

        Ok(Self {
            config,
            registry,
            session,
        })
    }

    /// Registered table ids, dependencies first.
    pub fn table_order(&self) -> Result<Vec<String>> {
        self.registry.topo_order()
    }

    /// Resolves one table and writes its rows as JSON lines to stdout.
    /// `on_failure = empty` turns a failed table into an empty emission.
    pub async fn fetch_table(&self, id: &str) -> Result<()> {
        match self.session.get_table(id).await {
            Ok(rows) => {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                for row in rows.iter() {
                    serde_json::to_writer(&mut out, row)?;
                    out.write_all(b"\n")?;
                }
                info!(table = id, rows = rows.len(), "table emitted");
                Ok(())
            }
            Err(e) if self.config.extract.on_failure == FailureMode::Empty
                && !matches!(e, Error::Config(_)) =>
            {
                error!(table = id, error = %e, "table failed, emitting nothing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
