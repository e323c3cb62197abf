use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Address family of a scan. Each family carries its own cache file,
/// remote list source and host expansion rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IpFamily {
    #[default]
    V4,
    V6,
}

impl IpFamily {
    /// Map the wire selector to a family. Only `6` selects IPv6.
    pub fn from_selector(n: i64) -> Self {
        if n == 6 {
            IpFamily::V6
        } else {
            IpFamily::V4
        }
    }

    pub fn selector(self) -> u8 {
        match self {
            IpFamily::V4 => 4,
            IpFamily::V6 => 6,
        }
    }

    /// File name of the cached subnet list inside the data directory.
    pub fn cache_name(self) -> &'static str {
        match self {
            IpFamily::V4 => "ips-v4.txt",
            IpFamily::V6 => "ips-v6.txt",
        }
    }

    /// Remote source the subnet list is fetched from when no cache exists.
    pub fn source_url(self) -> &'static str {
        match self {
            IpFamily::V4 => "https://www.baipiao.eu.org/cloudflare/ips-v4",
            IpFamily::V6 => "https://www.baipiao.eu.org/cloudflare/ips-v6",
        }
    }

    /// Pick one random host inside `subnet`. Returns `None` for malformed entries.
    pub fn random_host<R: Rng + ?Sized>(self, subnet: &str, rng: &mut R) -> Option<String> {
        match self {
            IpFamily::V4 => random_ipv4_host(subnet, rng),
            IpFamily::V6 => random_ipv6_host(subnet, rng),
        }
    }
}

impl Serialize for IpFamily {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(self.selector())
    }
}

impl<'de> Deserialize<'de> for IpFamily {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        i64::deserialize(d).map(IpFamily::from_selector)
    }
}

impl std::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("IPv4"),
            IpFamily::V6 => f.write_str("IPv6"),
        }
    }
}

/// Split a subnet list file into trimmed, non-empty lines.
pub fn parse_subnet_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Expand every well-formed subnet into one random candidate address.
///
/// Malformed entries are skipped. Repeated calls may pick different hosts
/// inside the same subnet.
pub fn expand_subnets<R: Rng + ?Sized>(
    subnets: &[String],
    family: IpFamily,
    rng: &mut R,
) -> Vec<String> {
    subnets
        .iter()
        .filter_map(|s| family.random_host(s, rng))
        .collect()
}

fn strip_prefix_len(subnet: &str) -> &str {
    subnet.split('/').next().unwrap_or(subnet).trim()
}

fn random_ipv4_host<R: Rng + ?Sized>(subnet: &str, rng: &mut R) -> Option<String> {
    let octets: Vec<&str> = strip_prefix_len(subnet).split('.').collect();
    if octets.len() != 4 {
        return None;
    }
    let host: u8 = rng.gen();
    Some(format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], host))
}

fn random_ipv6_host<R: Rng + ?Sized>(subnet: &str, rng: &mut R) -> Option<String> {
    let groups: Vec<&str> = strip_prefix_len(subnet).split(':').collect();
    if groups.len() < 3 {
        return None;
    }
    let mut out: Vec<String> = groups[..3].iter().map(|g| g.to_string()).collect();
    for _ in 0..5 {
        out.push(format!("{:x}", rng.gen::<u16>()));
    }
    Some(out.join(":"))
}
