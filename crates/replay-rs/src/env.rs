use std::env;

pub(crate) const WARMUP_RUNS_VAR: &str = "REPLAY_RS_WARMUP_RUNS";
pub(crate) const STRICT_SIGNATURE_VAR: &str = "REPLAY_RS_STRICT_SIGNATURE";

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn non_empty(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

pub(crate) fn warmup_runs() -> Option<usize> {
    non_empty(WARMUP_RUNS_VAR).and_then(|value| value.trim().parse().ok())
}

pub(crate) fn strict_signature() -> Option<bool> {
    non_empty(STRICT_SIGNATURE_VAR).map(|value| parse_bool(&value))
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value:?} should parse as true");
        }
        for value in ["0", "false", "off", "nope"] {
            assert!(!parse_bool(value), "{value:?} should parse as false");
        }
    }
}
