use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity of the deployment a `Baton` manages. Stable for the lifetime of
/// the runner driving it.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

/// A placement quota: nodes are selected by label, and `keepPods` is the
/// number of Running pods the group should hold. An absent `keepPods` means
/// the group is unconstrained; it never scales out or sheds surplus, but it
/// may donate pods to groups below target.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    /// Nodes whose labels are a superset of this map belong to the group.
    /// Membership is recomputed on every tick.
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub keep_pods: Option<u32>,
}

impl Strategy {
    pub fn keep_pods(&self) -> u32 {
        self.keep_pods.unwrap_or(0)
    }

    /// More pods on the group's nodes than the target asks for.
    pub fn is_surplus(&self, pods: &[Pod]) -> bool {
        let keep = self.keep_pods();
        keep > 0 && pods.len() as u32 > keep
    }

    /// Fewer pods on the group's nodes than the target asks for.
    pub fn is_shortage(&self, pods: &[Pod]) -> bool {
        let keep = self.keep_pods();
        keep > 0 && (pods.len() as u32) < keep
    }

    /// Strategies are identified by their node selector.
    pub fn same_selector(&self, other: &Strategy) -> bool {
        self.node_selector == other.node_selector
    }
}

pub fn total_keep_pods(strategies: &[Strategy]) -> u32 {
    strategies.iter().map(Strategy::keep_pods).sum()
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "baton.io",
    version = "v1",
    kind = "Baton",
    plural = "batons",
    derive = "PartialEq",
    status = "BatonStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastRunStartedAt\", \"name\": \"LAST RUN\", \"type\": \"date\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastSuccessfulRunAt\", \"name\": \"LAST SUCCESS\", \"type\": \"date\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct BatonSpec {
    pub workload: WorkloadRef,
    pub strategies: Vec<Strategy>,
    pub interval_sec: u32,
    pub monitor_timeout_sec: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatonStatus {
    pub last_run_started_at: Option<Time>,
    pub last_successful_run_at: Option<Time>,
}

/// Whether two specs describe the same managed workload configuration.
/// Strategy order is irrelevant; everything else is compared field by field.
pub fn same_spec(a: &BatonSpec, b: &BatonSpec) -> bool {
    a.workload == b.workload
        && a.interval_sec == b.interval_sec
        && a.monitor_timeout_sec == b.monitor_timeout_sec
        && same_strategy_set(&a.strategies, &b.strategies)
}

/// Strategy sets compare as unordered sets keyed by node-selector identity.
pub fn same_strategy_set(a: &[Strategy], b: &[Strategy]) -> bool {
    fn covered(xs: &[Strategy], ys: &[Strategy]) -> bool {
        xs.iter()
            .all(|s| ys.iter().any(|t| s.same_selector(t) && s.keep_pods() == t.keep_pods()))
    }
    a.len() == b.len() && covered(a, b) && covered(b, a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn strategy(selector: &[(&str, &str)], keep: Option<u32>) -> Strategy {
        Strategy {
            node_selector: selector
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            keep_pods: keep,
        }
    }

    fn spec(strategies: Vec<Strategy>) -> BatonSpec {
        BatonSpec {
            workload: WorkloadRef {
                namespace: "default".to_string(),
                name: "web".to_string(),
            },
            strategies,
            interval_sec: 60,
            monitor_timeout_sec: 300,
        }
    }

    #[test]
    fn unconstrained_strategy_is_never_surplus_or_short() {
        let s = strategy(&[("zone", "a")], None);
        let pods = vec![pod("p1"), pod("p2"), pod("p3")];
        assert_eq!(s.keep_pods(), 0);
        assert!(!s.is_surplus(&pods));
        assert!(!s.is_shortage(&pods));
        assert!(!s.is_shortage(&[]));
    }

    #[test]
    fn surplus_and_shortage_are_strict() {
        let s = strategy(&[("zone", "a")], Some(2));
        assert!(s.is_surplus(&[pod("p1"), pod("p2"), pod("p3")]));
        assert!(!s.is_surplus(&[pod("p1"), pod("p2")]));
        assert!(s.is_shortage(&[pod("p1")]));
        assert!(!s.is_shortage(&[pod("p1"), pod("p2")]));
    }

    #[test]
    fn total_keep_pods_ignores_unconstrained_groups() {
        let strategies = vec![
            strategy(&[("zone", "a")], Some(2)),
            strategy(&[("zone", "b")], None),
            strategy(&[("zone", "c")], Some(1)),
        ];
        assert_eq!(total_keep_pods(&strategies), 3);
    }

    #[test]
    fn same_spec_is_reflexive() {
        let a = spec(vec![
            strategy(&[("zone", "a")], Some(2)),
            strategy(&[("zone", "b")], Some(1)),
        ]);
        assert!(same_spec(&a, &a));
    }

    #[test]
    fn strategy_order_does_not_matter() {
        let a = spec(vec![
            strategy(&[("zone", "a")], Some(2)),
            strategy(&[("zone", "b")], Some(1)),
        ]);
        let b = spec(vec![
            strategy(&[("zone", "b")], Some(1)),
            strategy(&[("zone", "a")], Some(2)),
        ]);
        assert!(same_spec(&a, &b));
    }

    #[test]
    fn changed_keep_pods_changes_the_spec() {
        let a = spec(vec![strategy(&[("zone", "a")], Some(2))]);
        let b = spec(vec![strategy(&[("zone", "a")], Some(3))]);
        assert!(!same_spec(&a, &b));
    }

    #[test]
    fn changed_interval_or_timeout_changes_the_spec() {
        let a = spec(vec![strategy(&[("zone", "a")], Some(2))]);
        let mut b = a.clone();
        b.interval_sec = 30;
        assert!(!same_spec(&a, &b));
        let mut c = a.clone();
        c.monitor_timeout_sec = 60;
        assert!(!same_spec(&a, &c));
    }

    #[test]
    fn changed_workload_changes_the_spec() {
        let a = spec(vec![strategy(&[("zone", "a")], Some(2))]);
        let mut b = a.clone();
        b.workload.name = "api".to_string();
        assert!(!same_spec(&a, &b));
    }

    #[test]
    fn duplicate_selectors_do_not_mask_a_difference() {
        let a = vec![
            strategy(&[("zone", "a")], Some(2)),
            strategy(&[("zone", "a")], Some(2)),
        ];
        let b = vec![
            strategy(&[("zone", "a")], Some(2)),
            strategy(&[("zone", "b")], Some(2)),
        ];
        assert!(!same_strategy_set(&a, &b));
    }
}
