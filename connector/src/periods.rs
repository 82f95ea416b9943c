use tracing::debug;

use connector_core::Result;

use crate::client::QueryApi;
use crate::model::{DateRange, Granularity};

/// Period tokens bounding an extraction window: the week and month
/// containing each end of the range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPeriods {
    pub start_week: String,
    pub start_month: String,
    pub end_week: String,
    pub end_month: String,
}

/// Resolves all four tokens with one concurrent burst. Each lookup retries
/// independently inside the client; the first lookup to exhaust its budget
/// fails the whole resolution.
pub async fn resolve(api: &dyn QueryApi, range: &DateRange) -> Result<ResolvedPeriods> {
    let (start_week, start_month, end_week, end_month) = tokio::try_join!(
        api.time_value(range.start, Granularity::Weekly),
        api.time_value(range.start, Granularity::Monthly),
        api.time_value(range.end, Granularity::Weekly),
        api.time_value(range.end, Granularity::Monthly),
    )?;

    let periods = ResolvedPeriods {
        start_week,
        start_month,
        end_week,
        end_month,
    };
    debug!(?periods, "resolved extraction window");
    Ok(periods)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{Datelike, NaiveDate};
    use pretty_assertions::assert_eq;

    use connector_core::{Error, Result};

    use super::*;
    use crate::model::{QueryResponse, QuerySpec};

    struct FakePeriods {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
        fail_monthly_end: bool,
    }

    impl FakePeriods {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                fail_monthly_end: false,
            }
        }
    }

    #[async_trait]
    impl QueryApi for FakePeriods {
        async fn fetch_page(&self, _spec: &QuerySpec, _offset: u64) -> Result<QueryResponse> {
            unreachable!("period resolution never fetches pages")
        }

        async fn time_value(&self, date: NaiveDate, granularity: Granularity) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_monthly_end && granularity == Granularity::Monthly && date.month() == 6 {
                return Err(Error::RetryExhausted {
                    target: format!("time/{granularity}/{date}"),
                    attempts: 5,
                    cause: Box::new(Error::UpstreamStatus {
                        status: 503,
                        url: "http://example.com".into(),
                    }),
                });
            }

            let prefix = match granularity {
                Granularity::Weekly => "W",
                Granularity::Monthly => "M",
            };
            Ok(format!("{}{}", prefix, date.format("%Y%m%d")))
        }
    }

    fn range() -> DateRange {
        DateRange::parse_compact("20160101", "20160630").unwrap()
    }

    #[tokio::test]
    async fn resolves_all_four_tokens_concurrently() {
        let api = FakePeriods::new();
        let periods = resolve(&api, &range()).await.unwrap();

        assert_eq!(
            periods,
            ResolvedPeriods {
                start_week: "W20160101".to_string(),
                start_month: "M20160101".to_string(),
                end_week: "W20160630".to_string(),
                end_month: "M20160630".to_string(),
            }
        );
        assert_eq!(api.calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            api.max_in_flight.load(Ordering::SeqCst),
            4,
            "all four lookups must be in flight together"
        );
    }

    #[tokio::test]
    async fn one_exhausted_lookup_fails_the_resolution() {
        let mut api = FakePeriods::new();
        api.fail_monthly_end = true;
        let result = resolve(&api, &range()).await;
        assert!(matches!(result, Err(Error::RetryExhausted { .. })));
    }
}
