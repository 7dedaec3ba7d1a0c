//! Funnel definitions: ordered steps of path, event and attribute matchers.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{FunnelError, FunnelResult};
use crate::types::QueryScope;

/// Highest step number read from legacy `step{n}_*` parameters.
pub const LEGACY_MAX_STEPS: usize = 8;

/// Whether a step must happen after the previous one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceMode {
    #[default]
    Ordered,
    Any,
}

/// A funnel definition. Immutable once handed to an analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelConfig {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepFilter>,
    #[serde(default, alias = "sequenceMode")]
    pub sequence_mode: SequenceMode,
    /// Maximum hours between consecutive steps.
    #[serde(default, alias = "timeWindow", skip_serializing_if = "Option::is_none")]
    pub time_window_hours: Option<f64>,
}

/// Matchers for one funnel step. Every populated matcher must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, alias = "path", alias = "pathExact", deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub path_exact: Vec<String>,
    #[serde(default, alias = "pathPattern", deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub path_pattern: Vec<String>,
    #[serde(default, alias = "pathRegex", deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub path_regex: Vec<String>,
    #[serde(default, alias = "pathPrefix", deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub path_prefix: Vec<String>,
    #[serde(default, alias = "eventName", deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub event_name: Vec<String>,

    #[serde(default, alias = "countryCode", deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub country: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub region: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub city: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub language: Vec<String>,

    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub os: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub browser: Vec<String>,
    #[serde(default, alias = "device", deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub platform: Vec<String>,

    #[serde(default, alias = "utmSource", deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub utm_source: Vec<String>,
    #[serde(default, alias = "utmMedium", deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub utm_medium: Vec<String>,
    #[serde(default, alias = "utmCampaign", deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub utm_campaign: Vec<String>,
    #[serde(default, alias = "referrerName", deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub referrer_name: Vec<String>,

    /// Overrides the funnel-level mode for the transition into this step.
    #[serde(default, alias = "sequenceMode", skip_serializing_if = "Option::is_none")]
    pub sequence_mode: Option<SequenceMode>,
    /// Overrides the funnel-level window for the transition into this step.
    #[serde(default, alias = "timeWindow", skip_serializing_if = "Option::is_none")]
    pub time_window_hours: Option<f64>,
}

/// A matcher field of [`StepFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Matcher {
    PathExact,
    PathPattern,
    PathRegex,
    PathPrefix,
    EventName,
    Country,
    Region,
    City,
    Language,
    Os,
    Browser,
    Platform,
    UtmSource,
    UtmMedium,
    UtmCampaign,
    ReferrerName,
}

impl Matcher {
    pub const ALL: [Matcher; 16] = [
        Matcher::PathExact,
        Matcher::PathPattern,
        Matcher::PathRegex,
        Matcher::PathPrefix,
        Matcher::EventName,
        Matcher::Country,
        Matcher::Region,
        Matcher::City,
        Matcher::Language,
        Matcher::Os,
        Matcher::Browser,
        Matcher::Platform,
        Matcher::UtmSource,
        Matcher::UtmMedium,
        Matcher::UtmCampaign,
        Matcher::ReferrerName,
    ];

    /// Field name as written in funnel definitions and legacy parameters.
    pub fn field_name(self) -> &'static str {
        match self {
            Matcher::PathExact => "path_exact",
            Matcher::PathPattern => "path_pattern",
            Matcher::PathRegex => "path_regex",
            Matcher::PathPrefix => "path_prefix",
            Matcher::EventName => "event_name",
            Matcher::Country => "country",
            Matcher::Region => "region",
            Matcher::City => "city",
            Matcher::Language => "language",
            Matcher::Os => "os",
            Matcher::Browser => "browser",
            Matcher::Platform => "platform",
            Matcher::UtmSource => "utm_source",
            Matcher::UtmMedium => "utm_medium",
            Matcher::UtmCampaign => "utm_campaign",
            Matcher::ReferrerName => "referrer_name",
        }
    }

    /// Path and event matchers identify *what* happened; the rest only
    /// narrow down who did it.
    pub fn is_primary(self) -> bool {
        matches!(
            self,
            Matcher::PathExact
                | Matcher::PathPattern
                | Matcher::PathRegex
                | Matcher::PathPrefix
                | Matcher::EventName
        )
    }
}

impl StepFilter {
    /// Values for one matcher, empty when unset.
    pub fn values(&self, matcher: Matcher) -> &[String] {
        match matcher {
            Matcher::PathExact => &self.path_exact,
            Matcher::PathPattern => &self.path_pattern,
            Matcher::PathRegex => &self.path_regex,
            Matcher::PathPrefix => &self.path_prefix,
            Matcher::EventName => &self.event_name,
            Matcher::Country => &self.country,
            Matcher::Region => &self.region,
            Matcher::City => &self.city,
            Matcher::Language => &self.language,
            Matcher::Os => &self.os,
            Matcher::Browser => &self.browser,
            Matcher::Platform => &self.platform,
            Matcher::UtmSource => &self.utm_source,
            Matcher::UtmMedium => &self.utm_medium,
            Matcher::UtmCampaign => &self.utm_campaign,
            Matcher::ReferrerName => &self.referrer_name,
        }
    }

    fn values_mut(&mut self, matcher: Matcher) -> &mut Vec<String> {
        match matcher {
            Matcher::PathExact => &mut self.path_exact,
            Matcher::PathPattern => &mut self.path_pattern,
            Matcher::PathRegex => &mut self.path_regex,
            Matcher::PathPrefix => &mut self.path_prefix,
            Matcher::EventName => &mut self.event_name,
            Matcher::Country => &mut self.country,
            Matcher::Region => &mut self.region,
            Matcher::City => &mut self.city,
            Matcher::Language => &mut self.language,
            Matcher::Os => &mut self.os,
            Matcher::Browser => &mut self.browser,
            Matcher::Platform => &mut self.platform,
            Matcher::UtmSource => &mut self.utm_source,
            Matcher::UtmMedium => &mut self.utm_medium,
            Matcher::UtmCampaign => &mut self.utm_campaign,
            Matcher::ReferrerName => &mut self.referrer_name,
        }
    }

    /// Set a matcher to a single value. Blank values clear it.
    pub fn with(mut self, matcher: Matcher, value: impl Into<String>) -> Self {
        let value = value.into();
        let slot = self.values_mut(matcher);
        slot.clear();
        if !value.trim().is_empty() {
            slot.push(value);
        }
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Populated matchers in declaration order, blank entries skipped.
    pub fn active_matchers(&self) -> impl Iterator<Item = (Matcher, Vec<&str>)> + '_ {
        Matcher::ALL.into_iter().filter_map(move |matcher| {
            let values: Vec<&str> = self
                .values(matcher)
                .iter()
                .map(String::as_str)
                .filter(|v| !v.trim().is_empty())
                .collect();
            (!values.is_empty()).then_some((matcher, values))
        })
    }

    pub fn has_matchers(&self) -> bool {
        self.active_matchers().next().is_some()
    }

    /// Display label, falling back to the position in the funnel.
    pub fn label(&self, step: usize) -> String {
        self.name.clone().unwrap_or_else(|| format!("Step {step}"))
    }
}

impl FunnelConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<StepFilter>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            steps,
            sequence_mode: SequenceMode::default(),
            time_window_hours: None,
        }
    }

    /// Landing, pricing, checkout, success.
    pub fn standard() -> Self {
        Self::new(
            "standard-checkout",
            "Standard Checkout Flow",
            vec![
                StepFilter::default().with(Matcher::PathExact, "/").named("Landing"),
                StepFilter::default().with(Matcher::PathPattern, "/pricing%").named("Pricing"),
                StepFilter::default().with(Matcher::PathExact, "/checkout").named("Checkout"),
                StepFilter::default().with(Matcher::PathExact, "/success").named("Success"),
            ],
        )
    }

    /// Reject definitions that cannot produce a meaningful funnel. An empty
    /// step list is accepted and evaluates to no metrics.
    pub fn validate(&self, min_steps: usize) -> FunnelResult<()> {
        if self.steps.is_empty() {
            return Ok(());
        }
        if self.steps.len() < min_steps {
            return Err(FunnelError::Config(format!(
                "funnel '{}' has {} step(s), at least {} required",
                self.id,
                self.steps.len(),
                min_steps
            )));
        }
        if let Some(index) = self.steps.iter().position(|s| !s.has_matchers()) {
            return Err(FunnelError::Config(format!(
                "step {} of funnel '{}' has no matchers",
                index + 1,
                self.id
            )));
        }
        for window in self
            .time_window_hours
            .iter()
            .chain(self.steps.iter().filter_map(|s| s.time_window_hours.as_ref()))
        {
            if !window.is_finite() || *window < 0.0 {
                return Err(FunnelError::Config(format!(
                    "funnel '{}' has an invalid time window of {window} hours",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Sequence mode for the transition into `index` (0-based).
    pub fn sequence_mode_for(&self, index: usize) -> SequenceMode {
        self.steps
            .get(index)
            .and_then(|s| s.sequence_mode)
            .unwrap_or(self.sequence_mode)
    }

    /// Time window for the transition into `index` (0-based).
    pub fn time_window_for(&self, index: usize) -> Option<f64> {
        self.steps
            .get(index)
            .and_then(|s| s.time_window_hours)
            .or(self.time_window_hours)
    }

    /// Parse a funnel definition from JSON.
    pub fn from_json(raw: &str) -> FunnelResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Build a funnel from flat `step{n}_{field}` parameters as produced by
    /// older dashboard URLs. A step exists only if it carries a path or event
    /// matcher; reading stops at the first step that does not.
    pub fn from_legacy_params(params: &HashMap<String, String>) -> (Self, QueryScope) {
        let mut steps = Vec::new();

        for n in 1..=LEGACY_MAX_STEPS {
            let mut step = StepFilter::default();
            let mut has_primary = false;

            // Legacy URLs never carried a prefix matcher.
            for matcher in Matcher::ALL.into_iter().filter(|m| *m != Matcher::PathPrefix) {
                let key = format!("step{n}_{}", matcher.field_name());
                if let Some(value) = params.get(&key).filter(|v| !v.trim().is_empty()) {
                    step = step.with(matcher, value.clone());
                    has_primary |= matcher.is_primary();
                }
            }

            if !has_primary {
                break;
            }
            steps.push(step);
        }

        let lookup = |a: &str, b: &str| params.get(a).or_else(|| params.get(b)).cloned();
        let scope = QueryScope {
            date_from: lookup("date_from", "dateFrom"),
            date_to: lookup("date_to", "dateTo"),
            site_id: lookup("site_id", "siteId"),
        };

        (Self::new("legacy", "Legacy Funnel", steps), scope)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// Accept `"x"`, `["x", "y"]` or `null` for a matcher.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    };
    Ok(values.into_iter().filter(|v| !v.trim().is_empty()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_matchers_become_single_element_lists() {
        let step: StepFilter = serde_json::from_str(
            r#"{"path_exact": "/pricing", "country": ["US", "CA"], "os": null}"#,
        )
        .unwrap();
        assert_eq!(step.path_exact, vec!["/pricing"]);
        assert_eq!(step.country, vec!["US", "CA"]);
        assert!(step.os.is_empty());
    }

    #[test]
    fn test_camel_case_aliases() {
        let step: StepFilter = serde_json::from_str(
            r#"{"name": "Add to Cart", "eventName": ["Add to Cart"], "path": ["/product"], "timeWindow": 2}"#,
        )
        .unwrap();
        assert_eq!(step.event_name, vec!["Add to Cart"]);
        assert_eq!(step.path_exact, vec!["/product"]);
        assert_eq!(step.time_window_hours, Some(2.0));
    }

    #[test]
    fn test_blank_values_are_not_matchers() {
        let step: StepFilter = serde_json::from_str(r#"{"name": "Empty", "path_exact": ""}"#).unwrap();
        assert!(!step.has_matchers());

        let step = StepFilter::default().with(Matcher::Browser, "Firefox");
        assert!(step.has_matchers());
    }

    #[test]
    fn test_validate_rejects_single_step() {
        let config = FunnelConfig::new(
            "one",
            "One",
            vec![StepFilter::default().with(Matcher::PathExact, "/")],
        );
        assert!(matches!(config.validate(2), Err(FunnelError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_step_without_matchers() {
        let config = FunnelConfig::new(
            "f",
            "F",
            vec![
                StepFilter::default().with(Matcher::PathExact, "/"),
                StepFilter::default().named("Nothing"),
            ],
        );
        let err = config.validate(2).unwrap_err();
        assert!(err.to_string().contains("step 2"));
    }

    #[test]
    fn test_validate_accepts_empty_and_standard() {
        assert!(FunnelConfig::new("e", "E", vec![]).validate(2).is_ok());
        assert!(FunnelConfig::standard().validate(2).is_ok());
    }

    #[test]
    fn test_validate_rejects_negative_window() {
        let mut config = FunnelConfig::standard();
        config.time_window_hours = Some(-1.0);
        assert!(config.validate(2).is_err());
    }

    #[test]
    fn test_step_overrides_funnel_settings() {
        let mut config = FunnelConfig::standard();
        config.time_window_hours = Some(24.0);
        config.steps[1].time_window_hours = Some(2.0);
        config.steps[2].sequence_mode = Some(SequenceMode::Any);

        assert_eq!(config.time_window_for(1), Some(2.0));
        assert_eq!(config.time_window_for(2), Some(24.0));
        assert_eq!(config.sequence_mode_for(2), SequenceMode::Any);
        assert_eq!(config.sequence_mode_for(3), SequenceMode::Ordered);
    }

    #[test]
    fn test_from_legacy_params() {
        let params: HashMap<String, String> = [
            ("step1_path_exact", "/"),
            ("step1_country", "US"),
            ("step2_event_name", "signup"),
            ("step2_platform", "mobile"),
            ("step3_country", "DE"),
            ("step4_path_exact", "/never-read"),
            ("dateFrom", "2024-01-01"),
            ("date_to", "2024-01-31"),
            ("site_id", "acme"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let (config, scope) = FunnelConfig::from_legacy_params(&params);
        assert_eq!(config.steps.len(), 2);
        assert_eq!(config.steps[0].country, vec!["US"]);
        assert_eq!(config.steps[1].platform, vec!["mobile"]);
        assert_eq!(scope.date_from.as_deref(), Some("2024-01-01"));
        assert_eq!(scope.date_to.as_deref(), Some("2024-01-31"));
        assert_eq!(scope.site_id.as_deref(), Some("acme"));
    }

    #[test]
    fn test_legacy_prefix_does_not_define_a_step() {
        let params: HashMap<String, String> = [
            ("step1_path_exact", "/"),
            ("step2_path_prefix", "/blog"),
            ("step3_path_exact", "/signup"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let (config, _) = FunnelConfig::from_legacy_params(&params);
        assert_eq!(config.steps.len(), 1);
        assert!(config.steps[0].path_prefix.is_empty());
    }

    #[test]
    fn test_legacy_prefix_is_ignored_on_existing_step() {
        let params: HashMap<String, String> = [
            ("step1_event_name", "visit"),
            ("step1_path_prefix", "/docs"),
            ("step2_path_regex", "^/done$"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let (config, _) = FunnelConfig::from_legacy_params(&params);
        assert_eq!(config.steps.len(), 2);
        assert!(config.steps[0].path_prefix.is_empty());
        assert_eq!(config.steps[1].path_regex, vec!["^/done$"]);
    }

    #[test]
    fn test_from_json() {
        let config = FunnelConfig::from_json(
            r#"{"id": "f", "name": "F", "steps": [{"path": "/"}, {"eventName": "buy"}]}"#,
        )
        .unwrap();
        assert_eq!(config.steps.len(), 2);
        assert_eq!(config.steps[1].event_name, vec!["buy"]);

        let err = FunnelConfig::from_json(r#"{"id": "f"}"#).unwrap_err();
        assert!(matches!(err, FunnelError::Serialization(_)));
    }
}
