use async_trait::async_trait;

use connector_core::Result;

use crate::model::{Filter, Granularity, QuerySpec, Row};
use crate::periods::ResolvedPeriods;
use crate::tables::{FetchContext, Table, TableRegistry, TableRows};

pub const KEYWORD: &str = "keyword";
pub const KEYWORD_VOLUME_TRENDING: &str = "keyword_volume_trending";

/// Search engine restriction applied to the trending dataset.
const SEARCH_ENGINES: &[(&str, &str)] = &[
    ("-1", "34"),
    ("-1", "44"),
    ("-1", "102"),
    ("-1", "268"),
    ("-1", "43"),
];

/// Weekly keyword rank positions across the extraction window.
pub struct KeywordRankings {
    page_size: u64,
}

impl KeywordRankings {
    pub fn new(page_size: u64) -> Self {
        Self { page_size }
    }

    fn spec(&self, periods: &ResolvedPeriods) -> QuerySpec {
        QuerySpec {
            dataset: KEYWORD.to_string(),
            dimensions: vec![
                "keyword".to_string(),
                "time".to_string(),
                "search_engine".to_string(),
                "page_url".to_string(),
            ],
            measures: vec!["blended_rank".to_string()],
            granularity: Some(Granularity::Weekly),
            filters: vec![
                Filter::ge("time", &periods.start_week),
                Filter::le("time", &periods.end_week),
            ],
            page_size: self.page_size,
        }
    }
}

#[async_trait]
impl Table for KeywordRankings {
    fn id(&self) -> &str {
        KEYWORD
    }

    async fn fetch(
        &self,
        ctx: &FetchContext,
        _increment: Option<&str>,
        _deps: &[TableRows],
    ) -> Result<Vec<Row>> {
        let periods = ctx.periods().await?;
        ctx.collect(&self.spec(periods)).await
    }
}

/// Monthly search-volume trend per keyword, restricted to the engines the
/// deployment tracks.
pub struct KeywordVolumeTrending {
    page_size: u64,
}

impl KeywordVolumeTrending {
    pub fn new(page_size: u64) -> Self {
        Self { page_size }
    }

    fn spec(&self, periods: &ResolvedPeriods) -> QuerySpec {
        QuerySpec {
            dataset: KEYWORD_VOLUME_TRENDING.to_string(),
            dimensions: vec![
                "keyword".to_string(),
                "time".to_string(),
                "search_engine".to_string(),
            ],
            measures: vec!["avg_volume".to_string(), "search_volume".to_string()],
            granularity: Some(Granularity::Monthly),
            filters: vec![
                Filter::ge("time", &periods.start_month),
                Filter::le("time", &periods.end_month),
                Filter::members("search_engine", SEARCH_ENGINES),
            ],
            page_size: self.page_size,
        }
    }
}

#[async_trait]
impl Table for KeywordVolumeTrending {
    fn id(&self) -> &str {
        KEYWORD_VOLUME_TRENDING
    }

    async fn fetch(
        &self,
        ctx: &FetchContext,
        _increment: Option<&str>,
        _deps: &[TableRows],
    ) -> Result<Vec<Row>> {
        let periods = ctx.periods().await?;
        ctx.collect(&self.spec(periods)).await
    }
}

/// Registers the tables this deployment ships.
pub fn register_builtin(registry: &mut TableRegistry, page_size: u64) -> Result<()> {
    registry.register(std::sync::Arc::new(KeywordRankings::new(page_size)))?;
    registry.register(std::sync::Arc::new(KeywordVolumeTrending::new(page_size)))?;
    Ok(())
}
