//! Route matching.

use docket_common::EngineConfig;
use regex::Regex;
use tracing::trace;
use url::Url;

use crate::strategy::StrategyKind;
use crate::Result;

/// A compiled routing rule.
#[derive(Debug, Clone)]
pub struct RouteRule {
    /// Pattern evaluated against the full request URL.
    pub pattern: Regex,
    pub strategy: StrategyKind,
    /// Full partition name.
    pub store_name: String,
    pub max_age_seconds: Option<u64>,
    pub max_entries: Option<usize>,
}

/// Ordered routing table. The first matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct RouteMatcher {
    rules: Vec<RouteRule>,
}

impl RouteMatcher {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    /// Compile the configured routes. An invalid pattern fails startup.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let rules = config
            .routes
            .iter()
            .map(|route| {
                Ok(RouteRule {
                    pattern: Regex::new(&route.pattern)?,
                    strategy: StrategyKind::parse(&route.strategy),
                    store_name: config.partition_name(&route.store),
                    max_age_seconds: route.max_age_seconds,
                    max_entries: route.max_entries,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// First rule whose pattern matches the URL.
    pub fn find(&self, url: &Url) -> Option<&RouteRule> {
        let rule = self.rules.iter().find(|r| r.pattern.is_match(url.as_str()));
        trace!(url = %url, rule = rule.map(|r| r.pattern.as_str()), "Route lookup");
        rule
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }
}
