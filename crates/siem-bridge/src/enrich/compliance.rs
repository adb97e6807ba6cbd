// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Compliance regulation tagging.
//!
//! Tags depend only on the event category, the coarse kind, and whether an
//! identity user is present. Arrival order and time never influence the
//! result.

use crate::event::EventKind;
use std::collections::BTreeSet;

pub const SOX: &str = "SOX";
pub const PCI_DSS: &str = "PCI-DSS";
pub const GDPR: &str = "GDPR";
pub const HIPAA: &str = "HIPAA";
pub const NIST: &str = "NIST";
pub const ISO27001: &str = "ISO27001";

/// Regulation labels for an event category.
pub fn tags_for(category: &str, kind: EventKind, has_user: bool) -> BTreeSet<String> {
    let c = category.to_ascii_lowercase();
    let mut tags = BTreeSet::new();

    let mut add = |labels: &[&str]| {
        for label in labels {
            tags.insert((*label).to_string());
        }
    };

    if c.contains("auth") || c.contains("login") || c.contains("logout") {
        add(&[SOX, PCI_DSS, GDPR]);
    } else if c.contains("file") || c.contains("data_access") || c.contains("data access") {
        add(&[SOX, HIPAA, GDPR]);
    } else if c.contains("network") || c.contains("firewall") {
        add(&[PCI_DSS, NIST]);
    } else if c.contains("threat") || c.contains("malware") || kind == EventKind::Threat {
        add(&[NIST, ISO27001]);
    }

    // Events tied to a named user fall under data-protection scope.
    if has_user {
        tags.insert(GDPR.to_string());
    }

    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(tags: &BTreeSet<String>) -> Vec<&str> {
        tags.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_authentication_tags() {
        let tags = tags_for("authentication", EventKind::System, false);
        assert_eq!(labels(&tags), vec![GDPR, PCI_DSS, SOX]);

        let login = tags_for("user_login", EventKind::Generic, false);
        assert_eq!(login, tags);
    }

    #[test]
    fn test_file_access_tags() {
        let tags = tags_for("file_read", EventKind::System, false);
        assert_eq!(labels(&tags), vec![GDPR, HIPAA, SOX]);
    }

    #[test]
    fn test_network_tags() {
        let tags = tags_for("firewall_block", EventKind::Generic, false);
        assert_eq!(labels(&tags), vec![NIST, PCI_DSS]);

        let conn = tags_for("network_connection", EventKind::Generic, false);
        assert_eq!(conn, tags);
    }

    #[test]
    fn test_threat_tags() {
        let tags = tags_for("malware_beacon", EventKind::Generic, false);
        assert_eq!(labels(&tags), vec![ISO27001, NIST]);

        // Threat kind is the fallback even for unrecognized categories.
        let sqli = tags_for("sql_injection", EventKind::Threat, false);
        assert_eq!(sqli, tags);
    }

    #[test]
    fn test_user_presence_adds_gdpr() {
        let without = tags_for("sql_injection", EventKind::Threat, false);
        assert!(!without.contains(GDPR));
        let with = tags_for("sql_injection", EventKind::Threat, true);
        assert!(with.contains(GDPR));
        assert!(with.is_superset(&without));
    }

    #[test]
    fn test_determinism() {
        for _ in 0..10 {
            assert_eq!(
                tags_for("authentication", EventKind::System, true),
                tags_for("authentication", EventKind::System, true)
            );
        }
    }

    #[test]
    fn test_generic_unmatched_is_empty() {
        let tags = tags_for("heartbeat", EventKind::Generic, false);
        assert!(tags.is_empty());
    }
}
