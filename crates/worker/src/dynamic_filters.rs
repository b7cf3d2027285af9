//! Versioned dynamic-filter domain collection and delta retrieval.
//!
//! Execution publishes predicate refinements (for example the key set of a
//! hash-join build side) as it runs. Each publish gets a fresh version so the
//! coordinator node can poll for deltas: a caller that has already seen
//! version V receives exactly the domains published after V together with the
//! new high-water version.

use std::collections::BTreeMap;
use std::sync::Mutex;

use quarry_common::DynamicFilterId;
use serde::{Deserialize, Serialize};

/// Version reported before any domain has been published.
pub const INITIAL_DYNAMIC_FILTERS_VERSION: u64 = 0;

/// Scalar constant usable inside a dynamic-filter domain.
///
/// Bounds and value sets for one filter column share a variant in practice;
/// the derived total order falls back to variant order across variants so
/// [`Domain::intersect`] stays defined for all inputs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarValue {
    /// Boolean constant.
    Boolean(bool),
    /// 64-bit signed integer constant.
    Int64(i64),
    /// UTF-8 string constant.
    Utf8(String),
}

/// Predicate refinement over one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Every value passes.
    All,
    /// No value passes.
    None,
    /// The value must equal one of the listed constants (sorted, deduped).
    Values(Vec<ScalarValue>),
    /// Inclusive bounds; a missing bound is unbounded on that side.
    Range {
        /// Inclusive lower bound.
        low: Option<ScalarValue>,
        /// Inclusive upper bound.
        high: Option<ScalarValue>,
    },
}

impl Domain {
    /// Build a values domain with canonical (sorted, deduped) ordering.
    #[must_use]
    pub fn values(mut values: Vec<ScalarValue>) -> Self {
        values.sort();
        values.dedup();
        Self::Values(values)
    }

    /// Narrow this domain by another; the result passes a value only if both
    /// inputs pass it.
    #[must_use]
    pub fn intersect(&self, other: &Domain) -> Domain {
        match (self, other) {
            (Domain::All, d) | (d, Domain::All) => d.clone(),
            (Domain::None, _) | (_, Domain::None) => Domain::None,
            (Domain::Values(a), Domain::Values(b)) => {
                let kept = a.iter().filter(|v| b.contains(v)).cloned().collect();
                normalize_values(kept)
            }
            (Domain::Values(values), range @ Domain::Range { .. })
            | (range @ Domain::Range { .. }, Domain::Values(values)) => {
                let kept = values
                    .iter()
                    .filter(|v| range_contains(range, v))
                    .cloned()
                    .collect();
                normalize_values(kept)
            }
            (
                Domain::Range {
                    low: a_low,
                    high: a_high,
                },
                Domain::Range {
                    low: b_low,
                    high: b_high,
                },
            ) => {
                let low = max_bound(a_low, b_low);
                let high = min_bound(a_high, b_high);
                match (&low, &high) {
                    (Some(l), Some(h)) if l > h => Domain::None,
                    _ => Domain::Range { low, high },
                }
            }
        }
    }
}

fn normalize_values(values: Vec<ScalarValue>) -> Domain {
    if values.is_empty() {
        Domain::None
    } else {
        Domain::Values(values)
    }
}

fn range_contains(range: &Domain, value: &ScalarValue) -> bool {
    let Domain::Range { low, high } = range else {
        return false;
    };
    if low.as_ref().is_some_and(|l| value < l) {
        return false;
    }
    if high.as_ref().is_some_and(|h| value > h) {
        return false;
    }
    true
}

fn max_bound(a: &Option<ScalarValue>, b: &Option<ScalarValue>) -> Option<ScalarValue> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b).clone()),
        (Some(v), None) | (None, Some(v)) => Some(v.clone()),
        (None, None) => None,
    }
}

fn min_bound(a: &Option<ScalarValue>, b: &Option<ScalarValue>) -> Option<ScalarValue> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b).clone()),
        (Some(v), None) | (None, Some(v)) => Some(v.clone()),
        (None, None) => None,
    }
}

/// Domain snapshot tagged with the collector's high-water version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedDynamicFilterDomains {
    /// High-water version at the time of the snapshot.
    pub version: u64,
    /// Domains newer than the acknowledged version, keyed by filter id.
    pub domains: BTreeMap<DynamicFilterId, Domain>,
}

impl VersionedDynamicFilterDomains {
    /// Empty snapshot at [`INITIAL_DYNAMIC_FILTERS_VERSION`].
    #[must_use]
    pub fn initial() -> Self {
        Self {
            version: INITIAL_DYNAMIC_FILTERS_VERSION,
            domains: BTreeMap::new(),
        }
    }
}

struct VersionedDomain {
    version: u64,
    domain: Domain,
}

struct CollectorInner {
    version: u64,
    domains: BTreeMap<DynamicFilterId, VersionedDomain>,
}

/// Collects task-produced domains and serves version-aware deltas.
pub struct DynamicFiltersCollector {
    inner: Mutex<CollectorInner>,
}

impl DynamicFiltersCollector {
    /// Create an empty collector at [`INITIAL_DYNAMIC_FILTERS_VERSION`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CollectorInner {
                version: INITIAL_DYNAMIC_FILTERS_VERSION,
                domains: BTreeMap::new(),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_version(version: u64) -> Self {
        Self {
            inner: Mutex::new(CollectorInner {
                version,
                domains: BTreeMap::new(),
            }),
        }
    }

    /// Publish a batch of domains under one fresh version and return it.
    ///
    /// Re-published filter ids narrow the existing domain by intersection.
    /// Versions saturate on overflow.
    pub fn publish(&self, updates: BTreeMap<DynamicFilterId, Domain>) -> u64 {
        let mut inner = self.inner.lock().expect("collector lock");
        inner.version = inner.version.saturating_add(1);
        let version = inner.version;
        for (id, domain) in updates {
            let narrowed = match inner.domains.get(&id) {
                Some(existing) => existing.domain.intersect(&domain),
                None => domain,
            };
            inner.domains.insert(
                id,
                VersionedDomain {
                    version,
                    domain: narrowed,
                },
            );
        }
        version
    }

    /// Current high-water version.
    pub fn version(&self) -> u64 {
        self.inner.lock().expect("collector lock").version
    }

    /// Return the domains published after `callers_version` plus the current
    /// high-water version.
    pub fn acknowledge_and_get_new(&self, callers_version: u64) -> VersionedDynamicFilterDomains {
        let inner = self.inner.lock().expect("collector lock");
        let domains = inner
            .domains
            .iter()
            .filter(|(_, vd)| vd.version > callers_version)
            .map(|(id, vd)| (id.clone(), vd.domain.clone()))
            .collect();
        VersionedDynamicFilterDomains {
            version: inner.version,
            domains,
        }
    }

    /// Snapshot of every collected domain at the current version.
    pub fn current(&self) -> VersionedDynamicFilterDomains {
        let inner = self.inner.lock().expect("collector lock");
        let domains = inner
            .domains
            .iter()
            .map(|(id, vd)| (id.clone(), vd.domain.clone()))
            .collect();
        VersionedDynamicFilterDomains {
            version: inner.version,
            domains,
        }
    }
}

impl Default for DynamicFiltersCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(name: &str) -> DynamicFilterId {
        DynamicFilterId(name.to_string())
    }

    fn publish_one(collector: &DynamicFiltersCollector, name: &str, domain: Domain) -> u64 {
        collector.publish(BTreeMap::from([(filter(name), domain)]))
    }

    #[test]
    fn delta_contains_exactly_domains_after_acknowledged_version() {
        let collector = DynamicFiltersCollector::new();
        publish_one(&collector, "df_1", Domain::values(vec![ScalarValue::Int64(1)]));
        publish_one(&collector, "df_2", Domain::values(vec![ScalarValue::Int64(2)]));
        publish_one(&collector, "df_3", Domain::values(vec![ScalarValue::Int64(3)]));

        let delta = collector.acknowledge_and_get_new(1);
        assert_eq!(delta.version, 3);
        assert_eq!(
            delta.domains.keys().cloned().collect::<Vec<_>>(),
            vec![filter("df_2"), filter("df_3")]
        );

        let caught_up = collector.acknowledge_and_get_new(3);
        assert_eq!(caught_up.version, 3);
        assert!(caught_up.domains.is_empty());
    }

    #[test]
    fn republished_filter_narrows_and_moves_to_new_version() {
        let collector = DynamicFiltersCollector::new();
        publish_one(
            &collector,
            "df_1",
            Domain::values(vec![ScalarValue::Int64(1), ScalarValue::Int64(2)]),
        );
        publish_one(
            &collector,
            "df_1",
            Domain::values(vec![ScalarValue::Int64(2), ScalarValue::Int64(3)]),
        );

        let delta = collector.acknowledge_and_get_new(1);
        assert_eq!(delta.version, 2);
        assert_eq!(
            delta.domains.get(&filter("df_1")),
            Some(&Domain::Values(vec![ScalarValue::Int64(2)]))
        );
    }

    #[test]
    fn version_saturates_instead_of_wrapping() {
        let collector = DynamicFiltersCollector::with_version(u64::MAX);
        let version = publish_one(&collector, "df_1", Domain::All);
        assert_eq!(version, u64::MAX);
        assert_eq!(collector.version(), u64::MAX);
    }

    #[test]
    fn intersect_value_sets() {
        let a = Domain::values(vec![ScalarValue::Int64(1), ScalarValue::Int64(2)]);
        let b = Domain::values(vec![ScalarValue::Int64(2), ScalarValue::Int64(3)]);
        assert_eq!(a.intersect(&b), Domain::Values(vec![ScalarValue::Int64(2)]));

        let disjoint = Domain::values(vec![ScalarValue::Int64(9)]);
        assert_eq!(a.intersect(&disjoint), Domain::None);
    }

    #[test]
    fn intersect_values_with_range() {
        let values = Domain::values(vec![
            ScalarValue::Int64(1),
            ScalarValue::Int64(5),
            ScalarValue::Int64(9),
        ]);
        let range = Domain::Range {
            low: Some(ScalarValue::Int64(2)),
            high: Some(ScalarValue::Int64(9)),
        };
        assert_eq!(
            values.intersect(&range),
            Domain::Values(vec![ScalarValue::Int64(5), ScalarValue::Int64(9)])
        );
    }

    #[test]
    fn intersect_ranges_tightens_bounds() {
        let a = Domain::Range {
            low: Some(ScalarValue::Int64(0)),
            high: Some(ScalarValue::Int64(10)),
        };
        let b = Domain::Range {
            low: Some(ScalarValue::Int64(5)),
            high: None,
        };
        assert_eq!(
            a.intersect(&b),
            Domain::Range {
                low: Some(ScalarValue::Int64(5)),
                high: Some(ScalarValue::Int64(10)),
            }
        );

        let c = Domain::Range {
            low: Some(ScalarValue::Int64(20)),
            high: None,
        };
        assert_eq!(a.intersect(&c), Domain::None);
    }

    #[test]
    fn all_and_none_are_identity_and_absorbing() {
        let values = Domain::values(vec![ScalarValue::Utf8("x".to_string())]);
        assert_eq!(Domain::All.intersect(&values), values);
        assert_eq!(values.intersect(&Domain::None), Domain::None);
    }
}
