use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};
use vf_infra::types::{FleetDescriptor, MemberSpec, QuotaUsage, quota_keys};

use crate::sku;

/// A quota bucket the fleet would overrun.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub family: String,
    pub current: i64,
    pub projected: i64,
    pub allowed: i64,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} in use + {} requested > {} allowed",
            self.family, self.current, self.projected, self.allowed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub ok: bool,
    pub violations: Vec<Violation>,
}

/// `floor(limit * percent / 100)`.
pub fn allowed_usage(limit: i64, allowed_percent: f64) -> i64 {
    (limit as f64 * allowed_percent / 100.0).floor() as i64
}

/// Estimates whether a fleet fits in the remaining quota. Advisory only:
/// nothing is reserved, so a concurrent deployer can still win the race.
#[derive(Debug, Clone, Default)]
pub struct AdmissionController {
    /// Size name to core count for the target region.
    catalog: BTreeMap<String, u32>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(catalog: BTreeMap<String, u32>) -> Self {
        Self { catalog }
    }

    fn cores_for(&self, member: &MemberSpec) -> Option<u32> {
        member
            .cores
            .or_else(|| {
                self.catalog
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(&member.sku))
                    .map(|(_, cores)| *cores)
            })
            .or_else(|| sku::cores_from_name(&member.sku))
    }

    pub fn evaluate(
        &self,
        fleet: &FleetDescriptor,
        usage: &QuotaUsage,
        allowed_percent: f64,
    ) -> AdmissionDecision {
        let units = i64::from(fleet.units.max(1));
        let mut projected: BTreeMap<&str, i64> = BTreeMap::new();

        for member in &fleet.members {
            let Some(family) = sku::classify(&member.sku) else {
                warn!(sku = %member.sku, role = %member.role, "unregistered size family, skipping quota check");
                continue;
            };
            let Some(cores) = self.cores_for(member) else {
                warn!(sku = %member.sku, role = %member.role, "unknown core count, skipping quota check");
                continue;
            };
            let cores = i64::from(cores) * units;
            *projected.entry(family).or_default() += cores;
            *projected.entry(quota_keys::REGIONAL_CORES).or_default() += cores;
        }

        if fleet.needs_new_storage() {
            projected.insert(quota_keys::STORAGE_ACCOUNTS, units);
        }
        for key in [
            quota_keys::PUBLIC_IPS,
            quota_keys::VIRTUAL_NETWORKS,
            quota_keys::SECURITY_GROUPS,
            quota_keys::LOAD_BALANCERS,
        ] {
            projected.insert(key, units);
        }

        // simulate on a private copy; the caller's snapshot stays untouched
        let mut simulated = usage.clone();
        let mut violations = Vec::new();

        for (family, amount) in projected {
            let Some(before) = usage.get(family) else {
                warn!(family, "no usage reported for quota family, skipping");
                continue;
            };
            simulated.add(family, amount);
            let Some(after) = simulated.get(family) else {
                continue;
            };

            let allowed = allowed_usage(after.limit, allowed_percent);
            debug!(family, current = before.current, projected = amount, allowed, "quota check");
            if after.current > allowed {
                violations.push(Violation {
                    family: family.to_string(),
                    current: before.current,
                    projected: amount,
                    allowed,
                });
            }
        }

        AdmissionDecision {
            ok: violations.is_empty(),
            violations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fleet(members: serde_json::Value) -> FleetDescriptor {
        serde_json::from_value(json!({
            "name_prefix": "ICA",
            "region": "westus2",
            "members": members,
        }))
        .unwrap()
    }

    fn two_by_four() -> FleetDescriptor {
        fleet(json!([
            { "role": "client", "sku": "Standard_DS2_v2", "cores": 4, "image": "a:b:c:d" },
            { "role": "server", "sku": "Standard_DS2_v2", "cores": 4, "image": "a:b:c:d" },
        ]))
    }

    #[test]
    fn over_quota_family_is_rejected_with_exact_arithmetic() {
        let usage = QuotaUsage::new().with("standardDSv2Family", 100, 8);
        let decision = AdmissionController::new().evaluate(&two_by_four(), &usage, 100.0);

        assert!(!decision.ok);
        assert_eq!(
            decision.violations,
            vec![Violation {
                family: "standardDSv2Family".into(),
                current: 100,
                projected: 8,
                allowed: 8,
            }]
        );
    }

    #[test]
    fn allowed_percentage_floors() {
        assert_eq!(allowed_usage(10, 95.0), 9);
        assert_eq!(allowed_usage(8, 100.0), 8);
        assert_eq!(allowed_usage(7, 50.0), 3);
        assert_eq!(allowed_usage(0, 100.0), 0);
    }

    #[test]
    fn fits_exactly_at_the_bound() {
        let usage = QuotaUsage::new()
            .with("standardDSv2Family", 2, 10)
            .with(quota_keys::REGIONAL_CORES, 92, 100);
        let decision = AdmissionController::new().evaluate(&two_by_four(), &usage, 100.0);
        assert!(decision.ok, "{:?}", decision.violations);

        // 95% of 10 floors to 9, one core short
        let decision = AdmissionController::new().evaluate(&two_by_four(), &usage, 95.0);
        assert_eq!(decision.violations.len(), 2);
        assert_eq!(decision.violations[0].family, quota_keys::REGIONAL_CORES);
        assert_eq!(decision.violations[1].allowed, 9);
    }

    #[test]
    fn evaluate_is_pure() {
        let usage = QuotaUsage::new()
            .with("standardDSv2Family", 100, 8)
            .with(quota_keys::PUBLIC_IPS, 3, 10);
        let snapshot = usage.clone();
        let controller = AdmissionController::new();

        let first = controller.evaluate(&two_by_four(), &usage, 100.0);
        let second = controller.evaluate(&two_by_four(), &usage, 100.0);
        assert_eq!(first, second);
        assert_eq!(usage, snapshot);
    }

    #[test]
    fn unknown_family_and_missing_usage_are_skipped() {
        let fleet = fleet(json!([
            { "role": "gpu", "sku": "Experimental_X9", "cores": 64, "image": "a:b:c:d" },
            { "role": "vm", "sku": "Standard_F4", "image": "a:b:c:d" },
        ]));
        // no standardFFamily entry either
        let usage = QuotaUsage::new().with(quota_keys::REGIONAL_CORES, 0, 100);
        let decision = AdmissionController::new().evaluate(&fleet, &usage, 100.0);
        assert!(decision.ok);
    }

    #[test]
    fn network_and_storage_need_one_unit_each() {
        let fleet = fleet(json!([
            { "role": "vm", "sku": "Standard_D2_v3", "cores": 2, "storage": "new_premium", "image": "a:b:c:d" },
        ]));
        let usage = QuotaUsage::new()
            .with(quota_keys::STORAGE_ACCOUNTS, 250, 250)
            .with(quota_keys::PUBLIC_IPS, 9, 10)
            .with(quota_keys::VIRTUAL_NETWORKS, 50, 50)
            .with(quota_keys::SECURITY_GROUPS, 0, 100)
            .with(quota_keys::LOAD_BALANCERS, 0, 100);

        let decision = AdmissionController::new().evaluate(&fleet, &usage, 100.0);
        let families: Vec<&str> = decision.violations.iter().map(|v| v.family.as_str()).collect();
        assert_eq!(
            families,
            vec![quota_keys::STORAGE_ACCOUNTS, quota_keys::VIRTUAL_NETWORKS]
        );
        assert!(decision.violations.iter().all(|v| v.projected == 1));
    }

    #[test]
    fn newer_generation_sizes_charge_their_own_family() {
        let fleet = fleet(json!([
            { "role": "vm", "sku": "Standard_D4s_v4", "image": "a:b:c:d" },
        ]));
        // the legacy D family is exhausted, DSv4 is not
        let usage = QuotaUsage::new()
            .with("standardDFamily", 10, 10)
            .with("standardDSv4Family", 0, 4);
        let decision = AdmissionController::new().evaluate(&fleet, &usage, 100.0);
        assert!(decision.ok, "{:?}", decision.violations);

        let usage = QuotaUsage::new().with("standardDSv4Family", 2, 4);
        let decision = AdmissionController::new().evaluate(&fleet, &usage, 100.0);
        assert_eq!(decision.violations[0].family, "standardDSv4Family");
        assert_eq!(decision.violations[0].projected, 4);
    }

    #[test]
    fn catalog_supplies_missing_core_counts() {
        let fleet = fleet(json!([
            { "role": "vm", "sku": "Standard_DS2_v2", "image": "a:b:c:d" },
        ]));
        let usage = QuotaUsage::new().with("standardDSv2Family", 0, 2);

        // name says 2 cores, catalog says 8
        let catalog = BTreeMap::from([("Standard_DS2_v2".to_string(), 8)]);
        let decision = AdmissionController::with_catalog(catalog).evaluate(&fleet, &usage, 100.0);
        assert_eq!(decision.violations[0].projected, 8);

        let decision = AdmissionController::new().evaluate(&fleet, &usage, 100.0);
        assert!(decision.ok);
    }
}
