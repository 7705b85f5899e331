//! AllocatedNode naming
//!
//! Names are derived from the plugin, cluster and host so that re-running an
//! interrupted allocation recreates the same node instead of a second one.

use hwplugin_common::kube_utils::deterministic_hash;

/// Maximum length of an RFC 1123 label
const MAX_NAME_LEN: usize = 63;

/// Name of the AllocatedNode bound to a host
pub fn allocated_node_name(
    plugin_id: &str,
    cluster_id: &str,
    host_namespace: &str,
    host_name: &str,
) -> String {
    let raw = format!("{plugin_id}-{cluster_id}-{host_namespace}-{host_name}");
    let name = sanitize(&raw);
    if name.len() <= MAX_NAME_LEN && !name.is_empty() {
        return name;
    }

    let hash = deterministic_hash(&raw);
    let keep = MAX_NAME_LEN - hash.len() - 1;
    let prefix = name[..name.len().min(keep)].trim_end_matches('-');
    if prefix.is_empty() {
        hash
    } else {
        format!("{prefix}-{hash}")
    }
}

/// Lowercase, replace anything outside `[a-z0-9-]` with `-`, collapse runs of
/// `-` and trim them from both ends
fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars().map(|c| c.to_ascii_lowercase()) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(c);
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}
