//! Static region/IP deny list

use std::collections::HashSet;

/// Deny-list check over two sets loaded at startup. No mutation, no side
/// effects; region and IP arrive as request metadata from the transport
/// layer.
pub struct AccessControl {
    blocked_regions: HashSet<String>,
    blocked_ips: HashSet<String>,
}

impl AccessControl {
    pub fn new(blocked_regions: HashSet<String>, blocked_ips: HashSet<String>) -> Self {
        // Region codes compare case-insensitively; store them upper-case.
        let blocked_regions = blocked_regions
            .into_iter()
            .map(|r| r.to_ascii_uppercase())
            .collect();

        Self {
            blocked_regions,
            blocked_ips,
        }
    }

    /// True if the region is blocked or the IP is blocked. An empty region
    /// (edge did not supply one) never matches.
    pub fn is_blocked(&self, region: &str, ip: &str) -> bool {
        if !region.is_empty() && self.blocked_regions.contains(&region.to_ascii_uppercase()) {
            return true;
        }
        self.blocked_ips.contains(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> AccessControl {
        AccessControl::new(
            ["cn".to_string(), "KP".to_string()].into(),
            ["1.2.3.4".to_string()].into(),
        )
    }

    #[test]
    fn test_block_table() {
        let access = control();

        // (region, ip, expected)
        let cases = [
            ("CN", "5.6.7.8", true),
            ("cn", "5.6.7.8", true),
            ("KP", "1.2.3.4", true),
            ("US", "1.2.3.4", true),
            ("US", "5.6.7.8", false),
            ("", "5.6.7.8", false),
            ("", "1.2.3.4", true),
        ];

        for (region, ip, expected) in cases {
            assert_eq!(
                access.is_blocked(region, ip),
                expected,
                "region={region:?} ip={ip:?}"
            );
        }
    }

    #[test]
    fn test_empty_lists_block_nothing() {
        let access = AccessControl::new(HashSet::new(), HashSet::new());
        assert!(!access.is_blocked("CN", "1.2.3.4"));
        assert!(!access.is_blocked("", ""));
    }
}
