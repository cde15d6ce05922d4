//! Canonicalization rules for the two bucket keys (spec §4.J): "Canonical
//! path: concatenate base + path, collapse runs of `/`, truncate to 256
//! characters. Canonical IP: walk the forwarded-for chain, pick the
//! client-side address."

/// Collapses runs of `/` and truncates to 256 characters.
pub fn canonicalize_path(base: &str, path: &str) -> String {
    let combined = format!("{base}{path}");
    let mut collapsed = String::with_capacity(combined.len());
    let mut last_was_slash = false;
    for c in combined.chars() {
        if c == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        collapsed.push(c);
    }
    collapsed.chars().take(256).collect()
}

pub fn resource_key(method: &str, host: &str, canonical_path: &str) -> String {
    format!("resource:{method}:{host}:{canonical_path}")
}

pub fn ip_key(ip: &str) -> String {
    format!("ip:{ip}")
}

/// All candidate client IPs for the allow-list check (spec §4.J step 1):
/// the forwarded-for chain plus the transport-level remote address.
pub fn candidate_ips(forwarded_for: Option<&str>, remote: Option<&str>) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(chain) = forwarded_for {
        out.extend(chain.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string));
    }
    if let Some(r) = remote {
        out.push(r.to_string());
    }
    out
}

/// The client-side address: the leftmost (origin-most) entry of the
/// forwarded-for chain, falling back to the transport remote address.
pub fn canonical_client_ip(forwarded_for: Option<&str>, remote: Option<&str>) -> Option<String> {
    if let Some(chain) = forwarded_for {
        if let Some(first) = chain.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return Some(first.to_string());
        }
    }
    remote.map(str::to_string)
}
