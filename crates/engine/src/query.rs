//! Backend query parameters for funnel steps.
//!
//! Parameter names come from a closed set: a [`QueryParam`] is either one of
//! the scope parameters or a [`Matcher`], so no parameter name is ever built
//! from caller-supplied text.

use std::borrow::Cow;
use std::collections::BTreeMap;

use funnel_core::{FunnelConfig, Matcher, QueryScope, StepFilter};

/// A query parameter understood by the funnel pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryParam {
    DateFrom,
    DateTo,
    SiteId,
    Limit,
    /// A matcher on the single-step pipe.
    Filter(Matcher),
    /// A matcher for step `n` (1-based) on the whole-funnel pipe.
    Numbered(usize, Matcher),
}

impl QueryParam {
    pub fn name(&self) -> Cow<'static, str> {
        match self {
            QueryParam::DateFrom => Cow::Borrowed("date_from"),
            QueryParam::DateTo => Cow::Borrowed("date_to"),
            QueryParam::SiteId => Cow::Borrowed("site_id"),
            QueryParam::Limit => Cow::Borrowed("limit"),
            // The step pipe calls the platform dimension `device`.
            QueryParam::Filter(Matcher::Platform) => Cow::Borrowed("device"),
            QueryParam::Filter(matcher) => Cow::Borrowed(matcher.field_name()),
            QueryParam::Numbered(step, matcher) => {
                Cow::Owned(format!("step{step}_{}", matcher.field_name()))
            }
        }
    }
}

/// Ordered parameter set for one backend request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepQuery {
    params: BTreeMap<QueryParam, String>,
}

impl StepQuery {
    /// Set a parameter. Blank values are dropped so the backend default applies.
    pub fn set(&mut self, param: QueryParam, value: impl Into<String>) {
        let value = value.into();
        if value.trim().is_empty() {
            self.params.remove(&param);
        } else {
            self.params.insert(param, value);
        }
    }

    pub fn get(&self, param: QueryParam) -> Option<&str> {
        self.params.get(&param).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// `(name, value)` pairs in stable order, ready for a query string.
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(param, value)| (param.name().into_owned(), value.clone()))
            .collect()
    }

    /// Stable serialization of every parameter, used to key the step cache.
    pub fn cache_key(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.pairs())
            .finish()
    }

    fn set_scope(&mut self, scope: &QueryScope) {
        if let Some(from) = &scope.date_from {
            self.set(QueryParam::DateFrom, from.as_str());
        }
        if let Some(to) = &scope.date_to {
            self.set(QueryParam::DateTo, to.as_str());
        }
        if let Some(site) = &scope.site_id {
            self.set(QueryParam::SiteId, site.as_str());
        }
    }
}

/// Parameters for the single-step pipe: scope, row limit and one parameter
/// per populated matcher. Multi-valued matchers are comma-joined.
pub fn build_step_query(step: &StepFilter, scope: &QueryScope, row_limit: u64) -> StepQuery {
    let mut query = StepQuery::default();
    query.set_scope(scope);
    query.set(QueryParam::Limit, row_limit.to_string());

    for (matcher, values) in step.active_matchers() {
        query.set(QueryParam::Filter(matcher), values.join(","));
    }
    query
}

/// Parameters for the whole-funnel pipe, every step's matchers numbered.
pub fn build_pipe_query(config: &FunnelConfig, scope: &QueryScope) -> StepQuery {
    let mut query = StepQuery::default();
    query.set_scope(scope);

    for (index, step) in config.steps.iter().enumerate() {
        for (matcher, values) in step.active_matchers() {
            query.set(QueryParam::Numbered(index + 1, matcher), values.join(","));
        }
    }
    query
}
