//! Port range grammar: `N | N-M`, comma separated (e.g. `1,3,6-8,10-100`).
//!
//! An empty string means the process does not listen on any port.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lowest and highest valid port numbers.
pub const MIN_PORT: u16 = 1;
pub const MAX_PORT: u16 = 65535;

/// Closed interval of ports, `min <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { min: port, max: port }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.min <= port && port <= self.max
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

/// Errors produced while parsing a port range string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortRangeError {
    #[error("unparsable port number {value:?} in token {token:?}")]
    InvalidPort { token: String, value: String },

    #[error("port {port} in token {token:?} is outside {MIN_PORT}-{MAX_PORT}")]
    OutOfRange { token: String, port: u64 },

    #[error("invalid port range token {token:?}: expected N or N-M")]
    InvalidFormat { token: String },

    #[error("invalid port range token {token:?}: lower bound {min} exceeds upper bound {max}")]
    Inverted { token: String, min: u16, max: u16 },
}

/// Parse a port range string into an ordered list of intervals.
///
/// Each token is first tried as a single port, then as `min-max`. Any bad
/// token fails the whole parse; partial results are never returned.
pub fn parse_port_range(input: &str) -> Result<Vec<PortRange>, PortRangeError> {
    if input.is_empty() {
        return Ok(Vec::new());
    }

    input.split(',').map(parse_token).collect()
}

/// Render intervals back into the compact grammar accepted by
/// [`parse_port_range`].
pub fn format_port_ranges(ranges: &[PortRange]) -> String {
    ranges
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_token(token: &str) -> Result<PortRange, PortRangeError> {
    if let Ok(port) = parse_port(token, token) {
        return Ok(PortRange::single(port));
    }

    let parts: Vec<&str> = token.split('-').collect();
    let [low, high] = parts.as_slice() else {
        return Err(PortRangeError::InvalidFormat {
            token: token.to_string(),
        });
    };

    let min = parse_port(token, low)?;
    let max = parse_port(token, high)?;
    if min > max {
        return Err(PortRangeError::Inverted {
            token: token.to_string(),
            min,
            max,
        });
    }
    Ok(PortRange { min, max })
}

fn parse_port(token: &str, value: &str) -> Result<u16, PortRangeError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PortRangeError::InvalidPort {
            token: token.to_string(),
            value: value.to_string(),
        });
    }

    // Digits only, so the only parse failure left is overflow.
    let port = trimmed.parse::<u64>().unwrap_or(u64::MAX);
    match u16::try_from(port) {
        Ok(p) if p >= MIN_PORT => Ok(p),
        _ => Err(PortRangeError::OutOfRange {
            token: token.to_string(),
            port,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(pairs: &[(u16, u16)]) -> Vec<PortRange> {
        pairs
            .iter()
            .map(|&(min, max)| PortRange { min, max })
            .collect()
    }

    #[test]
    fn parses_mixed_tokens() {
        let parsed = parse_port_range("1,3,6-8,10-100").unwrap();
        assert_eq!(parsed, ranges(&[(1, 1), (3, 3), (6, 8), (10, 100)]));
    }

    #[test]
    fn empty_string_disables_ports() {
        assert!(parse_port_range("").unwrap().is_empty());
    }

    #[test]
    fn rejects_out_of_range_single_port() {
        let err = parse_port_range("70000").unwrap_err();
        assert!(err.to_string().contains("70000"), "{err}");
    }

    #[test]
    fn rejects_inverted_range() {
        let err = parse_port_range("8-3").unwrap_err();
        assert_eq!(
            err,
            PortRangeError::Inverted {
                token: "8-3".to_string(),
                min: 8,
                max: 3
            }
        );
    }

    #[test]
    fn rejects_zero_and_bad_shapes() {
        assert!(parse_port_range("0").is_err());
        assert!(parse_port_range("1-2-3").is_err());
        assert!(parse_port_range("1,,3").is_err());
        assert!(parse_port_range("abc").is_err());
        assert!(parse_port_range("10-").is_err());
        assert!(parse_port_range("99999999999999999999999").is_err());
    }

    #[test]
    fn one_bad_token_fails_everything() {
        let err = parse_port_range("80,443,8-3,9000").unwrap_err();
        assert!(matches!(err, PortRangeError::Inverted { ref token, .. } if token == "8-3"));
    }

    #[test]
    fn tolerates_whitespace_around_numbers() {
        assert_eq!(
            parse_port_range(" 80, 1000 - 2000").unwrap(),
            ranges(&[(80, 80), (1000, 2000)])
        );
    }

    #[test]
    fn format_then_reparse_is_stable() {
        for input in ["1,3,6-8,10-100", "65535", "1-65535,22", "5-5"] {
            let parsed = parse_port_range(input).unwrap();
            let reparsed = parse_port_range(&format_port_ranges(&parsed)).unwrap();
            assert_eq!(parsed, reparsed, "input {input}");
            for r in &reparsed {
                assert!(r.min <= r.max);
                assert!(r.min >= MIN_PORT);
            }
        }
    }

    #[test]
    fn contains_is_inclusive() {
        let r = PortRange { min: 10, max: 20 };
        assert!(r.contains(10));
        assert!(r.contains(20));
        assert!(!r.contains(21));
    }
}
