use std::sync::atomic::{AtomicU32, Ordering};

use vf_infra::types::FleetDescriptor;

/// Longest container name the control plane accepts from us.
pub const MAX_CONTAINER_NAME: usize = 80;

/// Replace characters the control plane rejects with `-`.
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '(' | ')') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Shorten to `max` characters, keeping `prefix` and the tail of the rest.
/// The tail carries the run id and counter, which are the unique part.
pub fn truncate_keep_prefix(name: &str, max: usize, prefix: &str) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    match name.strip_prefix(prefix) {
        Some(rest) if prefix.len() < max => {
            let keep = max - prefix.len();
            format!("{prefix}{}", &rest[rest.len() - keep..])
        }
        _ => name[name.len() - max..].to_string(),
    }
}

/// Generates container names for one run.
#[derive(Debug)]
pub struct NameGenerator {
    prefix: String,
    base: String,
    counter: AtomicU32,
}

impl NameGenerator {
    pub fn new(fleet: &FleetDescriptor, run_id: &str) -> Self {
        let prefix = normalize(&fleet.name_prefix);
        let (tag, distro, run) = (
            normalize(&fleet.tag),
            normalize(&fleet.distro),
            normalize(run_id),
        );
        let base = [prefix.as_str(), tag.as_str(), distro.as_str(), run.as_str()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("-");

        Self {
            prefix,
            base,
            counter: AtomicU32::new(0),
        }
    }

    /// `prefix-tag-distro-runid-N`, with N increasing on every call.
    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.fit(format!("{}-{n}", self.base))
    }

    /// `prefix-index`, used when a run spreads several units over regions.
    pub fn for_unit(&self, index: u32) -> String {
        self.fit(format!("{}-{index}", self.prefix))
    }

    fn fit(&self, name: String) -> String {
        truncate_keep_prefix(&name, MAX_CONTAINER_NAME, &format!("{}-", self.prefix))
    }
}
