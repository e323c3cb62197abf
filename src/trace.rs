//! Parser for the edge trace document (`/cdn-cgi/trace`).
//!
//! The body is a list of `key=value` lines, for example:
//!
//! ```text
//! fl=12f34
//! h=203.0.113.7
//! ip=198.51.100.2
//! uag=Mozilla/5.0
//! colo=HKG
//! ```
use std::collections::HashMap;
use thiserror::Error;

/// User agent sent by the probe. The trace echoes it back as `uag`.
pub const PROBE_USER_AGENT: &str = "Mozilla/5.0";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TraceError {
    #[error("response does not echo the probe user agent")]
    MarkerMissing,
    #[error("response carries no site code")]
    SiteCodeMissing,
}

/// Fields of a trace response that the scanner relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceReport {
    pub site: String,
    pub fields: HashMap<String, String>,
}

impl TraceReport {
    /// Parse a raw response (headers may be included; non `key=value` lines
    /// are ignored).
    pub fn parse(text: &str) -> Result<Self, TraceError> {
        let fields: HashMap<String, String> = text
            .lines()
            .filter_map(|line| {
                let (k, v) = line.trim().split_once('=')?;
                if k.is_empty() || !k.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
                    return None;
                }
                Some((k.to_string(), v.trim().to_string()))
            })
            .collect();

        if fields.get("uag").map(String::as_str) != Some(PROBE_USER_AGENT) {
            return Err(TraceError::MarkerMissing);
        }

        let site: String = fields
            .get("colo")
            .map(|v| v.chars().take_while(char::is_ascii_uppercase).collect())
            .unwrap_or_default();
        if site.is_empty() {
            return Err(TraceError::SiteCodeMissing);
        }

        Ok(Self { site, fields })
    }
}
