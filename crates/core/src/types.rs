use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Which pipeline (or external producer) a segment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    Demographic,
    Behavioral,
    Rfm,
    Lifecycle,
    ValueBased,
    Engagement,
    Lookalike,
    Predictive,
    Custom,
}

/// RFM-derived customer lifecycle stages, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Champions,
    LoyalCustomers,
    PotentialLoyalists,
    NewCustomers,
    Promising,
    NeedAttention,
    AboutToSleep,
    AtRisk,
    CannotLose,
    Hibernating,
    Lost,
}

impl LifecycleStage {
    pub const ALL: [LifecycleStage; 11] = [
        LifecycleStage::Champions,
        LifecycleStage::LoyalCustomers,
        LifecycleStage::PotentialLoyalists,
        LifecycleStage::NewCustomers,
        LifecycleStage::Promising,
        LifecycleStage::NeedAttention,
        LifecycleStage::AboutToSleep,
        LifecycleStage::AtRisk,
        LifecycleStage::CannotLose,
        LifecycleStage::Hibernating,
        LifecycleStage::Lost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Champions => "champions",
            Self::LoyalCustomers => "loyal_customers",
            Self::PotentialLoyalists => "potential_loyalists",
            Self::NewCustomers => "new_customers",
            Self::Promising => "promising",
            Self::NeedAttention => "need_attention",
            Self::AboutToSleep => "about_to_sleep",
            Self::AtRisk => "at_risk",
            Self::CannotLose => "cannot_lose",
            Self::Hibernating => "hibernating",
            Self::Lost => "lost",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Champions => "Champions",
            Self::LoyalCustomers => "Loyal Customers",
            Self::PotentialLoyalists => "Potential Loyalists",
            Self::NewCustomers => "New Customers",
            Self::Promising => "Promising",
            Self::NeedAttention => "Need Attention",
            Self::AboutToSleep => "About To Sleep",
            Self::AtRisk => "At Risk",
            Self::CannotLose => "Cannot Lose",
            Self::Hibernating => "Hibernating",
            Self::Lost => "Lost",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Champions => "Your best customers. High recency, frequency, and monetary value.",
            Self::LoyalCustomers => "Consistent buyers with good value and regular purchases.",
            Self::PotentialLoyalists => "Recent customers with potential to become loyal.",
            Self::NewCustomers => "Recently acquired customers to nurture.",
            Self::Promising => "Recent buyers showing good initial engagement.",
            Self::NeedAttention => "Above average customers showing signs of decline.",
            Self::AboutToSleep => "Declining customers who need re-engagement.",
            Self::AtRisk => "Previously high-value customers at risk of churning.",
            Self::CannotLose => "High-value customers who haven't purchased recently.",
            Self::Hibernating => "Inactive customers with low engagement.",
            Self::Lost => "Customers with very low engagement and value.",
        }
    }
}

impl std::fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecycleStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LifecycleStage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown lifecycle stage: {s}"))
    }
}

/// Average R/F/M scores of a segment's members, truncated to integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RfmScores {
    pub avg_recency_score: u8,
    pub avg_frequency_score: u8,
    pub avg_monetary_score: u8,
}

/// A named, scored cohort produced by one pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudienceSegment {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub segment_type: SegmentType,
    pub lifecycle_stage: Option<LifecycleStage>,
    pub size: usize,
    pub criteria: Map<String, Value>,
    pub performance_metrics: BTreeMap<String, f64>,
    pub platforms: BTreeSet<String>,
    pub created_date: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub is_active: bool,
    pub confidence_score: f64,
    pub predicted_ltv: f64,
    pub recommended_actions: Vec<String>,
    pub rfm_scores: Option<RfmScores>,
    pub behavioral_patterns: Option<Map<String, Value>>,
}

/// One raw input row: a JSON object supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerRecord(pub Map<String, Value>);

impl CustomerRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field).filter(|v| !v.is_null())
    }

    pub fn has(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    /// Names from `required` that are absent (or null) in this record.
    pub fn missing_fields<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        required
            .iter()
            .copied()
            .filter(|field| !self.has(field))
            .collect()
    }

    /// Customer identifier; numeric ids are rendered as their decimal form.
    pub fn customer_id(&self) -> Option<String> {
        match self.get("customer_id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Numeric field. Numeric strings are accepted; non-finite values such
    /// as `"NaN"` or `"inf"` count as missing.
    pub fn number(&self, field: &str) -> Option<f64> {
        let value = match self.get(field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        value.filter(|v| v.is_finite())
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field)?.as_str()
    }

    /// Timestamp field: RFC 3339, `YYYY-MM-DD`, or Unix seconds.
    pub fn timestamp(&self, field: &str) -> Option<DateTime<Utc>> {
        match self.get(field)? {
            Value::String(s) => {
                if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                    return Some(ts.with_timezone(&Utc));
                }
                let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
                Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
            }
            Value::Number(n) => Utc.timestamp_opt(n.as_i64()?, 0).single(),
            _ => None,
        }
    }
}

impl From<Value> for CustomerRecord {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> CustomerRecord {
        CustomerRecord::from(value)
    }

    #[test]
    fn test_lifecycle_stage_round_trips_through_str() {
        for stage in LifecycleStage::ALL {
            let parsed: LifecycleStage = stage.as_str().parse().unwrap();
            assert_eq!(parsed, stage);
        }
        assert!("sleeping".parse::<LifecycleStage>().is_err());
    }

    #[test]
    fn test_lifecycle_stage_serde_matches_as_str() {
        let json = serde_json::to_value(LifecycleStage::CannotLose).unwrap();
        assert_eq!(json, json!("cannot_lose"));
        let json = serde_json::to_value(SegmentType::ValueBased).unwrap();
        assert_eq!(json, json!("value_based"));
    }

    #[test]
    fn test_missing_fields_treats_null_as_missing() {
        let r = record(json!({"customer_id": "c1", "revenue": null}));
        assert_eq!(
            r.missing_fields(&["customer_id", "revenue", "timestamp"]),
            vec!["revenue", "timestamp"]
        );
    }

    #[test]
    fn test_customer_id_accepts_numbers() {
        assert_eq!(
            record(json!({"customer_id": 17})).customer_id().as_deref(),
            Some("17")
        );
        assert_eq!(record(json!({"customer_id": true})).customer_id(), None);
    }

    #[test]
    fn test_number_parses_numeric_strings() {
        let r = record(json!({"a": 2.5, "b": "3", "c": "x"}));
        assert_eq!(r.number("a"), Some(2.5));
        assert_eq!(r.number("b"), Some(3.0));
        assert_eq!(r.number("c"), None);
    }

    #[test]
    fn test_number_rejects_non_finite_strings() {
        let r = record(json!({"a": "NaN", "b": " inf ", "c": "-infinity", "d": "1e3"}));
        assert_eq!(r.number("a"), None);
        assert_eq!(r.number("b"), None);
        assert_eq!(r.number("c"), None);
        assert_eq!(r.number("d"), Some(1000.0));
    }

    #[test]
    fn test_timestamp_formats() {
        let r = record(json!({
            "rfc": "2024-03-01T12:00:00Z",
            "date": "2024-03-01",
            "unix": 1709251200,
            "bad": "yesterday",
        }));
        let date = r.timestamp("date").unwrap();
        assert_eq!(date.to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert_eq!(r.timestamp("unix").unwrap(), date);
        assert_eq!(
            (r.timestamp("rfc").unwrap() - date).num_hours(),
            12
        );
        assert!(r.timestamp("bad").is_none());
    }
}
