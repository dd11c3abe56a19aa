//! Server version ranges.
//!
//! Ranges use the semver comparator syntax of the `runonserver` query key:
//! space-separated comparators are AND-ed, `||` separates alternatives,
//! e.g. `>=9.4.0 <10.0.0 || >=12`.

use std::cmp::Ordering;
use std::fmt;

/// Server version as `major.minor.patch`.
///
/// From 10 onward the server has two-part versions (`16.2`), which map to
/// `16.2.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Decodes `server_version_num` (`90603` → 9.6.3, `160002` → 16.2.0).
    pub fn from_num(num: u32) -> Self {
        if num >= 100_000 {
            Self::new(num / 10_000, num % 10_000, 0)
        } else {
            Self::new(num / 10_000, num / 100 % 100, num % 100)
        }
    }

    /// Version prefix of `server_version` / `version()` output,
    /// e.g. `PostgreSQL 16.2 (Debian 16.2-1)` → `16.2`.
    pub fn short_version(version_text: &str) -> String {
        version_text
            .split_whitespace()
            .find(|word| word.starts_with(|c: char| c.is_ascii_digit()))
            .map(|word| {
                word.trim_end_matches(|c: char| !c.is_ascii_digit())
                    .to_string()
            })
            .unwrap_or_default()
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Comparator {
    op: Op,
    version: ServerVersion,
}

impl Comparator {
    fn matches(&self, version: ServerVersion) -> bool {
        let ord = version.cmp(&self.version);
        match self.op {
            Op::Eq => ord == Ordering::Equal,
            Op::Ne => ord != Ordering::Equal,
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
        }
    }
}

/// Set of server versions a query variant applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    source: String,
    alternatives: Vec<Vec<Comparator>>,
}

impl VersionRange {
    /// Matches every version.
    pub fn any() -> Self {
        Self {
            source: String::new(),
            alternatives: vec![Vec::new()],
        }
    }

    /// `>=from`.
    pub fn at_least(from: ServerVersion) -> Self {
        Self {
            source: format!(">={from}"),
            alternatives: vec![vec![Comparator {
                op: Op::Ge,
                version: from,
            }]],
        }
    }

    /// `>=from <until`.
    pub fn between(from: ServerVersion, until: ServerVersion) -> Self {
        Self {
            source: format!(">={from} <{until}"),
            alternatives: vec![vec![
                Comparator {
                    op: Op::Ge,
                    version: from,
                },
                Comparator {
                    op: Op::Lt,
                    version: until,
                },
            ]],
        }
    }

    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self::any());
        }

        let mut alternatives = Vec::new();
        for alternative in input.split("||") {
            let comparators = alternative
                .split_whitespace()
                .map(parse_comparator)
                .collect::<Result<Vec<_>, _>>()?;
            if comparators.is_empty() {
                return Err(format!("empty alternative in version range {input:?}"));
            }
            alternatives.push(comparators);
        }

        Ok(Self {
            source: input.to_string(),
            alternatives,
        })
    }

    pub fn matches(&self, version: ServerVersion) -> bool {
        self.alternatives
            .iter()
            .any(|all| all.iter().all(|c| c.matches(version)))
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.source.is_empty() {
            f.write_str("*")
        } else {
            f.write_str(&self.source)
        }
    }
}

fn parse_comparator(token: &str) -> Result<Comparator, String> {
    let (op, rest) = [
        (">=", Op::Ge),
        ("<=", Op::Le),
        ("!=", Op::Ne),
        ("==", Op::Eq),
        (">", Op::Gt),
        ("<", Op::Lt),
        ("=", Op::Eq),
    ]
    .iter()
    .find_map(|(prefix, op)| token.strip_prefix(prefix).map(|rest| (*op, rest)))
    .unwrap_or((Op::Eq, token));

    let mut parts = rest.split('.');
    let mut next = |required: bool| -> Result<u32, String> {
        match parts.next() {
            Some(p) => p
                .parse()
                .map_err(|_| format!("invalid version {rest:?} in comparator {token:?}")),
            None if required => Err(format!("missing version in comparator {token:?}")),
            None => Ok(0),
        }
    };
    let version = ServerVersion::new(next(true)?, next(false)?, next(false)?);
    if parts.next().is_some() {
        return Err(format!("too many version components in {token:?}"));
    }

    Ok(Comparator { op, version })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_server_version_num() {
        assert_eq!(ServerVersion::from_num(90603), ServerVersion::new(9, 6, 3));
        assert_eq!(ServerVersion::from_num(100004), ServerVersion::new(10, 4, 0));
        assert_eq!(ServerVersion::from_num(170000), ServerVersion::new(17, 0, 0));
    }

    #[test]
    fn short_version_from_version_text() {
        assert_eq!(
            ServerVersion::short_version("PostgreSQL 16.2 (Debian 16.2-1.pgdg120+2) on x86_64"),
            "16.2"
        );
        assert_eq!(ServerVersion::short_version("PostgreSQL 9.6.24, compiled by"), "9.6.24");
        assert_eq!(ServerVersion::short_version("unknown"), "");
    }

    #[test]
    fn ranges_with_and_or() {
        let range = VersionRange::parse(">=9.4.0 <10.0.0 || >=12").unwrap();
        assert!(range.matches(ServerVersion::new(9, 6, 3)));
        assert!(!range.matches(ServerVersion::new(10, 4, 0)));
        assert!(!range.matches(ServerVersion::new(9, 3, 0)));
        assert!(range.matches(ServerVersion::new(16, 2, 0)));
    }

    #[test]
    fn constructed_ranges_render_like_parsed_ones() {
        let range = VersionRange::between(ServerVersion::new(9, 4, 0), ServerVersion::new(10, 0, 0));
        assert_eq!(range.to_string(), ">=9.4.0 <10.0.0");
        assert_eq!(range, VersionRange::parse(">=9.4.0 <10.0.0").unwrap());
        assert!(VersionRange::at_least(ServerVersion::new(17, 0, 0)).matches(ServerVersion::new(17, 2, 0)));
    }

    #[test]
    fn bare_version_means_equal() {
        let range = VersionRange::parse("10.4").unwrap();
        assert!(range.matches(ServerVersion::new(10, 4, 0)));
        assert!(!range.matches(ServerVersion::new(10, 5, 0)));
    }

    #[test]
    fn empty_range_matches_everything() {
        assert!(VersionRange::parse("").unwrap().matches(ServerVersion::new(8, 4, 0)));
        assert_eq!(VersionRange::any().to_string(), "*");
    }

    #[test]
    fn invalid_ranges() {
        assert!(VersionRange::parse(">=ten").is_err());
        assert!(VersionRange::parse(">=1.2.3.4").is_err());
        assert!(VersionRange::parse(">=10 ||").is_err());
    }
}
