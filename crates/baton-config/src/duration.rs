//! Human-readable durations such as `500ms`, `30s`, `5m` or `1h`.

use std::time::Duration;

use crate::{ConfigError, ConfigResult};

/// Parse a duration with a `ms`, `s`, `m` or `h` suffix.
pub fn parse_duration(field: &str, value: &str) -> ConfigResult<Duration> {
    let invalid = |message: &str| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{} ({:?})", message, value),
    };

    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| invalid("missing unit"))?;
    let (amount, unit) = value.split_at(split);
    let amount: u64 = amount.parse().map_err(|_| invalid("expected a number"))?;

    let seconds = match unit {
        "ms" => return Ok(Duration::from_millis(amount)),
        "s" => Some(amount),
        "m" => amount.checked_mul(60),
        "h" => amount.checked_mul(3600),
        _ => return Err(invalid("unknown unit")),
    };
    seconds
        .map(Duration::from_secs)
        .ok_or_else(|| invalid("out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(
            parse_duration("t", "250ms").unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(parse_duration("t", "30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("t", "5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("t", "1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "30", "s", "1.5s", "10d", "-1s"] {
            assert!(
                matches!(
                    parse_duration("ttl", bad),
                    Err(ConfigError::InvalidValue { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_rejects_overflowing_amounts() {
        let hours = format!("{}h", u64::MAX / 1000);
        let minutes = format!("{}m", u64::MAX);
        for bad in [hours.as_str(), minutes.as_str()] {
            assert!(matches!(
                parse_duration("ttl", bad),
                Err(ConfigError::InvalidValue { .. })
            ));
        }
        assert_eq!(
            parse_duration("ttl", &format!("{}s", u64::MAX)).unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }
}
