//! Tenant rules as they appear in the rule document.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A single rule. `condition` and `action` are opaque to everything except
/// the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rule_id: String,

    /// Legacy identifier, used when `rule_id` is absent.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Filled from the enclosing key when the document is grouped by type.
    #[serde(default)]
    pub event_type: String,

    pub condition: String,
    pub action: String,

    /// Advisory. Does not alter control flow.
    #[serde(default)]
    pub send_email: bool,

    #[serde(default)]
    pub deduplication: bool,

    #[serde(default, with = "duration_serde")]
    pub dedup_window: Duration,

    /// Payload fields the rule touches. Checked statically, never at runtime.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload_fields: Vec<String>,
}

impl Rule {
    /// Effective identifier: `rule_id`, falling back to `name`.
    pub fn id(&self) -> &str {
        if self.rule_id.is_empty() {
            &self.name
        } else {
            &self.rule_id
        }
    }
}

/// Parse a duration like `90s`, `15m`, `1h30m`, `2d`, `250ms`, or a bare
/// integer count of nanoseconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(nanos) = s.parse::<u64>() {
        return Ok(Duration::from_nanos(nanos));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in duration '{input}'"))?;
        if digits == 0 {
            return Err(format!("invalid duration '{input}'"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid duration '{input}'"))?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "ns" => Duration::from_nanos(value),
            "us" => Duration::from_micros(value),
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(60 * 60)),
            "d" => Duration::from_secs(value.saturating_mul(60 * 60 * 24)),
            other => return Err(format!("unknown duration unit '{other}' in '{input}'")),
        };
        total = total.saturating_add(part);
    }
    Ok(total)
}

/// Accepts either an integer (nanoseconds) or a unit string. Writes the
/// coarsest unit that loses nothing.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Nanos(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        let text = if d.subsec_nanos() == 0 {
            format!("{}s", d.as_secs())
        } else if d.subsec_nanos() % 1_000_000 == 0 {
            format!("{}ms", d.as_millis())
        } else {
            format!("{}ns", d.as_nanos())
        };
        s.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Nanos(n) => Ok(Duration::from_nanos(n)),
            Raw::Text(t) => super::parse_duration(&t).map_err(serde::de::Error::custom),
        }
    }
}
