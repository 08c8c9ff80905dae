//! Static ranges for secondary hosting providers.
//!
//! Only used to put a label on endpoints the primary registry does not know.
//! The tables are a small, stable subset of each provider's published blocks;
//! a miss is expected and harmless.

use std::net::IpAddr;
use std::sync::OnceLock;

use regionscope_core::Cidr;

struct ProviderTable {
    name: &'static str,
    prefixes: &'static [&'static str],
}

const TABLES: &[ProviderTable] = &[
    ProviderTable {
        name: "Cloudflare",
        prefixes: &[
            "173.245.48.0/20",
            "103.21.244.0/22",
            "103.22.200.0/22",
            "103.31.4.0/22",
            "141.101.64.0/18",
            "108.162.192.0/18",
            "190.93.240.0/20",
            "188.114.96.0/20",
            "197.234.240.0/22",
            "198.41.128.0/17",
            "162.158.0.0/15",
            "104.16.0.0/13",
            "104.24.0.0/14",
            "172.64.0.0/13",
            "131.0.72.0/22",
            "2400:cb00::/32",
            "2606:4700::/32",
            "2803:f800::/32",
        ],
    },
    ProviderTable {
        name: "Google Cloud",
        prefixes: &[
            "34.64.0.0/10",
            "34.128.0.0/10",
            "35.184.0.0/13",
            "35.192.0.0/12",
            "35.208.0.0/12",
            "35.224.0.0/12",
            "35.240.0.0/13",
            "104.154.0.0/15",
            "104.196.0.0/14",
            "130.211.0.0/16",
            "146.148.0.0/17",
        ],
    },
    ProviderTable {
        name: "Microsoft Azure",
        prefixes: &[
            "13.64.0.0/11",
            "13.104.0.0/14",
            "20.33.0.0/16",
            "20.34.0.0/15",
            "20.36.0.0/14",
            "20.40.0.0/13",
            "20.48.0.0/12",
            "20.64.0.0/10",
            "40.64.0.0/10",
            "104.40.0.0/13",
            "137.116.0.0/15",
            "168.61.0.0/16",
            "191.232.0.0/13",
        ],
    },
    ProviderTable {
        name: "Akamai",
        prefixes: &[
            "2.16.0.0/13",
            "23.32.0.0/11",
            "23.192.0.0/11",
            "72.246.0.0/15",
            "96.6.0.0/15",
            "104.64.0.0/10",
            "184.24.0.0/13",
        ],
    },
];

fn parsed() -> &'static [(&'static str, Vec<Cidr>)] {
    static PARSED: OnceLock<Vec<(&'static str, Vec<Cidr>)>> = OnceLock::new();
    PARSED.get_or_init(|| {
        TABLES
            .iter()
            .map(|t| (t.name, t.prefixes.iter().filter_map(|p| Cidr::parse(p)).collect()))
            .collect()
    })
}

/// Name of the secondary provider that owns `ip`, if any.
pub fn identify(ip: IpAddr) -> Option<&'static str> {
    parsed()
        .iter()
        .find(|(_, ranges)| ranges.iter().any(|c| c.contains(ip)))
        .map(|(name, _)| *name)
}
