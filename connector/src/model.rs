use chrono::NaiveDate;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use connector_core::{Error, Result};

/// One result row: an opaque JSON object keyed by dimension/measure name.
pub type Row = serde_json::Map<String, serde_json::Value>;

pub const COMPACT_DATE: &str = "%Y%m%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Weekly,
    Monthly,
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Granularity::Weekly => write!(f, "weekly"),
            Granularity::Monthly => write!(f, "monthly"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(Error::Config(format!(
                "start date {start} is after end date {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn parse_compact(start: &str, end: &str) -> Result<Self> {
        let parse = |s: &str| {
            NaiveDate::parse_from_str(s, COMPACT_DATE)
                .map_err(|e| Error::Config(format!("invalid date '{s}': {e}")))
        };
        Self::new(parse(start)?, parse(end)?)
    }
}

/// One term of the query filter array. The wire form is heterogeneous:
/// bounds serialize as `[field, op, value]`, membership lists as
/// `[field, [[a, b], ...]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Filter {
    Bound(String, String, String),
    Members(String, Vec<(String, String)>),
}

impl Filter {
    pub fn ge(field: &str, value: &str) -> Self {
        Filter::Bound(field.to_string(), "ge".to_string(), value.to_string())
    }

    pub fn le(field: &str, value: &str) -> Self {
        Filter::Bound(field.to_string(), "le".to_string(), value.to_string())
    }

    pub fn members(field: &str, pairs: &[(&str, &str)]) -> Self {
        Filter::Members(
            field.to_string(),
            pairs
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DimensionOptions {
    pub time: Granularity,
}

/// Immutable description of one table's query: everything but the offset.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub dataset: String,
    pub dimensions: Vec<String>,
    pub measures: Vec<String>,
    pub granularity: Option<Granularity>,
    pub filters: Vec<Filter>,
    pub page_size: u64,
}

impl QuerySpec {
    /// The concrete body for one page. `count` and `offset` are strings on
    /// the wire.
    pub fn body(&self, offset: u64) -> QueryBody {
        QueryBody {
            dataset: self.dataset.clone(),
            dimension: self.dimensions.clone(),
            measures: self.measures.clone(),
            dimension_options: self.granularity.map(|time| DimensionOptions { time }),
            filter: self.filters.clone(),
            count: self.page_size,
            offset,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryBody {
    pub dataset: String,
    pub dimension: Vec<String>,
    pub measures: Vec<String>,
    #[serde(rename = "dimensionOptions", skip_serializing_if = "Option::is_none")]
    pub dimension_options: Option<DimensionOptions>,
    pub filter: Vec<Filter>,
    #[serde(serialize_with = "as_wire_string")]
    pub count: u64,
    #[serde(serialize_with = "as_wire_string")]
    pub offset: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryResponse {
    #[serde(deserialize_with = "u64_lenient")]
    pub total: u64,
    #[serde(default)]
    pub values: Vec<Row>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeValue {
    #[serde(deserialize_with = "string_lenient")]
    pub time_value: String,
}

fn as_wire_string<S>(n: &u64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(n)
}

/// The API is inconsistent about numeric fields; accept both forms.
fn u64_lenient<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(t) => t.parse::<u64>().map_err(de::Error::custom),
    }
}

fn string_lenient<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Text(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Num(n) => n.to_string(),
        Raw::Text(t) => t,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn keyword_spec() -> QuerySpec {
        QuerySpec {
            dataset: "keyword".to_string(),
            dimensions: vec![
                "keyword".to_string(),
                "time".to_string(),
                "search_engine".to_string(),
                "page_url".to_string(),
            ],
            measures: vec!["blended_rank".to_string()],
            granularity: Some(Granularity::Weekly),
            filters: vec![Filter::ge("time", "2016W01"), Filter::le("time", "2016W26")],
            page_size: 1000,
        }
    }

    #[test]
    fn query_body_matches_wire_format() {
        let body = keyword_spec().body(2000);
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            json!({
                "dataset": "keyword",
                "dimension": ["keyword", "time", "search_engine", "page_url"],
                "measures": ["blended_rank"],
                "dimensionOptions": {"time": "weekly"},
                "filter": [["time", "ge", "2016W01"], ["time", "le", "2016W26"]],
                "count": "1000",
                "offset": "2000",
            })
        );
    }

    #[test]
    fn membership_filter_serializes_as_nested_pairs() {
        let filter = Filter::members("search_engine", &[("-1", "34"), ("-1", "44")]);
        let value = serde_json::to_value(&filter).unwrap();
        assert_eq!(value, json!(["search_engine", [["-1", "34"], ["-1", "44"]]]));
    }

    #[test]
    fn body_without_granularity_omits_dimension_options() {
        let mut spec = keyword_spec();
        spec.granularity = None;
        let value = serde_json::to_value(spec.body(0)).unwrap();
        assert!(value.get("dimensionOptions").is_none());
    }

    #[test]
    fn total_accepts_number_or_string() {
        let from_num: QueryResponse =
            serde_json::from_value(json!({"total": 4521, "values": []})).unwrap();
        let from_text: QueryResponse =
            serde_json::from_value(json!({"total": "4521", "values": []})).unwrap();
        assert_eq!(from_num.total, 4521);
        assert_eq!(from_text.total, 4521);
    }

    #[test]
    fn missing_values_defaults_to_empty() {
        let resp: QueryResponse = serde_json::from_value(json!({"total": 0})).unwrap();
        assert_eq!(resp.total, 0);
        assert!(resp.values.is_empty());
    }

    #[test]
    fn time_value_coerces_numbers() {
        let from_num: TimeValue = serde_json::from_value(json!({"time_value": 201601})).unwrap();
        let from_text: TimeValue =
            serde_json::from_value(json!({"time_value": "2016W01"})).unwrap();
        assert_eq!(from_num.time_value, "201601");
        assert_eq!(from_text.time_value, "2016W01");
    }

    #[test]
    fn date_range_rejects_inverted_bounds() {
        assert!(DateRange::parse_compact("20160601", "20160101").is_err());
        let range = DateRange::parse_compact("20160101", "20160601").unwrap();
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2016, 1, 1).unwrap());
        assert_eq!(range.end, NaiveDate::from_ymd_opt(2016, 6, 1).unwrap());
    }
}
