//! VM size to quota family classification.
//!
//! Rules are evaluated in table order and the first match wins. A versioned
//! or premium variant must sit above the generic rule that would otherwise
//! swallow it; `no_rule_is_shadowed` keeps that true. A rule without a
//! suffix only matches unversioned names, so a size from a newer generation
//! with no rule of its own stays unclassified.

const VERSION_MARK: &str = "_v";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Basic,
    Standard,
}

#[derive(Debug, Clone, Copy)]
pub struct SkuRule {
    pub family: &'static str,
    pub tier: Tier,
    /// Matched against the lowercased size name after the tier prefix.
    pub prefix: &'static str,
    /// Empty means "no `_vN` suffix".
    pub suffix: &'static str,
}

const fn rule(family: &'static str, prefix: &'static str, suffix: &'static str) -> SkuRule {
    SkuRule {
        family,
        tier: Tier::Standard,
        prefix,
        suffix,
    }
}

pub const SKU_RULES: &[SkuRule] = &[
    SkuRule {
        family: "basicAFamily",
        tier: Tier::Basic,
        prefix: "a",
        suffix: "",
    },
    rule("standardAv2Family", "a", "_v2"),
    rule("standardA8_A11Family", "a8", ""),
    rule("standardA8_A11Family", "a9", ""),
    rule("standardA8_A11Family", "a10", ""),
    rule("standardA8_A11Family", "a11", ""),
    rule("standardA0_A7Family", "a", ""),
    rule("standardBSFamily", "b", ""),
    rule("standardDSv2Family", "ds", "_v2"),
    rule("standardDSFamily", "ds", ""),
    rule("standardDASv4Family", "d", "as_v4"),
    rule("standardDAv4Family", "d", "a_v4"),
    rule("standardDDSv4Family", "d", "ds_v4"),
    rule("standardDDv4Family", "d", "d_v4"),
    rule("standardDSv4Family", "d", "s_v4"),
    rule("standardDv4Family", "d", "_v4"),
    rule("standardDADSv5Family", "d", "ads_v5"),
    rule("standardDASv5Family", "d", "as_v5"),
    rule("standardDLDSv5Family", "d", "lds_v5"),
    rule("standardDLSv5Family", "d", "ls_v5"),
    rule("standardDDSv5Family", "d", "ds_v5"),
    rule("standardDDv5Family", "d", "d_v5"),
    rule("standardDSv5Family", "d", "s_v5"),
    rule("standardDv5Family", "d", "_v5"),
    rule("standardDSv3Family", "d", "s_v3"),
    rule("standardDv3Family", "d", "_v3"),
    rule("standardDv2Family", "d", "_v2"),
    rule("standardDFamily", "d", ""),
    rule("standardESv3Family", "e", "s_v3"),
    rule("standardEv3Family", "e", "_v3"),
    rule("standardFSv2Family", "f", "s_v2"),
    rule("standardFSFamily", "f", "s"),
    rule("standardFFamily", "f", ""),
    rule("standardGSFamily", "gs", ""),
    rule("standardGFamily", "g", ""),
    rule("standardHBSFamily", "hb", ""),
    rule("standardHCSFamily", "hc", ""),
    rule("standardHFamily", "h", ""),
    rule("standardLSFamily", "l", "s"),
    rule("standardMSFamily", "m", ""),
    rule("standardNCSv3Family", "nc", "s_v3"),
    rule("standardNCSv2Family", "nc", "s_v2"),
    rule("standardNCFamily", "nc", ""),
    rule("standardNVFamily", "nv", ""),
];

fn split_tier(sku: &str) -> Option<(Tier, String)> {
    let lower = sku.trim().to_ascii_lowercase();
    if let Some(rest) = lower.strip_prefix("standard_") {
        Some((Tier::Standard, rest.to_string()))
    } else {
        lower
            .strip_prefix("basic_")
            .map(|rest| (Tier::Basic, rest.to_string()))
    }
}

impl SkuRule {
    fn matches(&self, tier: Tier, name: &str) -> bool {
        self.tier == tier
            && name.starts_with(self.prefix)
            && name.ends_with(self.suffix)
            && (!self.suffix.is_empty() || !name.contains(VERSION_MARK))
    }

    /// Whether every size this rule matches is also matched by `other`.
    fn covered_by(&self, other: &SkuRule) -> bool {
        self.tier == other.tier
            && self.prefix.starts_with(other.prefix)
            && self.suffix.ends_with(other.suffix)
            && (!other.suffix.is_empty() || !self.suffix.contains(VERSION_MARK))
    }
}

/// Quota family of a size name such as `Standard_DS2_v2`, or `None` when no
/// family is registered for it.
pub fn classify(sku: &str) -> Option<&'static str> {
    let (tier, name) = split_tier(sku)?;
    SKU_RULES
        .iter()
        .find(|r| r.matches(tier, &name))
        .map(|r| r.family)
}

/// Trailing core count embedded in a size name, e.g. `Standard_D4s_v3` -> 4.
pub fn cores_from_name(sku: &str) -> Option<u32> {
    let (_, name) = split_tier(sku)?;
    let base = name.split('_').next()?;
    let digits: String = base
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
