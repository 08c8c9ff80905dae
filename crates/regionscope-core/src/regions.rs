//! Regions where the game's session service operates.
//!
//! Each entry carries the display name shown to players, the service host,
//! and the documented latency-probe host (`gamelift-ping.<region>.api.aws`)
//! where one exists. Regions flagged unstable are known to give players a
//! worse experience; consumers may warn about them.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownRegion {
    pub code: &'static str,
    pub name: &'static str,
    pub service_host: &'static str,
    pub ping_host: Option<&'static str>,
    pub stable: bool,
}

impl KnownRegion {
    /// Every hostname associated with the region.
    pub fn hostnames(&self) -> impl Iterator<Item = &'static str> {
        std::iter::once(self.service_host).chain(self.ping_host)
    }
}

macro_rules! region {
    ($code:literal, $name:literal, stable: $stable:literal) => {
        KnownRegion {
            code: $code,
            name: $name,
            service_host: concat!("gamelift.", $code, ".amazonaws.com"),
            ping_host: Some(concat!("gamelift-ping.", $code, ".api.aws")),
            stable: $stable,
        }
    };
}

pub const KNOWN_REGIONS: &[KnownRegion] = &[
    // Europe
    region!("eu-west-2", "Europe (London)", stable: false),
    region!("eu-west-1", "Europe (Ireland)", stable: true),
    region!("eu-central-1", "Europe (Frankfurt am Main)", stable: true),
    // Americas
    region!("us-east-1", "US East (N. Virginia)", stable: true),
    region!("us-east-2", "US East (Ohio)", stable: false),
    region!("us-west-1", "US West (N. California)", stable: true),
    region!("us-west-2", "US West (Oregon)", stable: true),
    region!("ca-central-1", "Canada (Central)", stable: false),
    region!("sa-east-1", "South America (São Paulo)", stable: true),
    // Asia Pacific
    region!("ap-northeast-1", "Asia Pacific (Tokyo)", stable: true),
    region!("ap-northeast-2", "Asia Pacific (Seoul)", stable: true),
    region!("ap-south-1", "Asia Pacific (Mumbai)", stable: true),
    region!("ap-southeast-1", "Asia Pacific (Singapore)", stable: true),
    KnownRegion {
        code: "ap-east-1",
        name: "Asia Pacific (Hong Kong)",
        service_host: "ec2.ap-east-1.amazonaws.com",
        ping_host: Some("gamelift-ping.ap-east-1.api.aws"),
        stable: true,
    },
    region!("ap-southeast-2", "Asia Pacific (Sydney)", stable: true),
    // China: no public ping endpoint.
    KnownRegion {
        code: "cn-north-1",
        name: "China (Beijing)",
        service_host: "gamelift.cn-north-1.amazonaws.com.cn",
        ping_host: None,
        stable: true,
    },
    KnownRegion {
        code: "cn-northwest-1",
        name: "China (Ningxia)",
        service_host: "gamelift.cn-northwest-1.amazonaws.com.cn",
        ping_host: None,
        stable: true,
    },
];

pub fn find(code: &str) -> Option<&'static KnownRegion> {
    KNOWN_REGIONS.iter().find(|r| r.code.eq_ignore_ascii_case(code))
}

/// True if the session service runs in `code`.
pub fn is_operating_region(code: &str) -> bool {
    find(code).is_some()
}

pub fn display_name(code: &str) -> Option<&'static str> {
    find(code).map(|r| r.name)
}

pub fn ping_host(code: &str) -> Option<&'static str> {
    find(code).and_then(|r| r.ping_host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn codes_are_unique() {
        let codes: HashSet<_> = KNOWN_REGIONS.iter().map(|r| r.code).collect();
        assert_eq!(codes.len(), KNOWN_REGIONS.len());
        assert_eq!(KNOWN_REGIONS.len(), 17);
    }

    #[test]
    fn ping_hosts_follow_naming() {
        assert_eq!(ping_host("eu-west-1"), Some("gamelift-ping.eu-west-1.api.aws"));
        assert_eq!(ping_host("ap-east-1"), Some("gamelift-ping.ap-east-1.api.aws"));
        assert_eq!(ping_host("cn-north-1"), None);
        assert_eq!(ping_host("eu-test-1"), None);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(display_name("EU-WEST-1"), Some("Europe (Ireland)"));
        assert!(is_operating_region("us-east-2"));
        assert!(!is_operating_region("me-south-1"));
    }

    #[test]
    fn unstable_regions() {
        let unstable: Vec<_> = KNOWN_REGIONS.iter().filter(|r| !r.stable).map(|r| r.code).collect();
        assert_eq!(unstable, ["eu-west-2", "us-east-2", "ca-central-1"]);
    }

    #[test]
    fn hostnames_include_service_and_ping() {
        let hk: Vec<_> = find("ap-east-1").unwrap().hostnames().collect();
        assert_eq!(hk, ["ec2.ap-east-1.amazonaws.com", "gamelift-ping.ap-east-1.api.aws"]);
        assert_eq!(find("cn-northwest-1").unwrap().hostnames().count(), 1);
    }
}
