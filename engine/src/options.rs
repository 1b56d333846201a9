use serde::Deserialize;

pub const MAX_CHANNEL_FAILURES_ENV: &str = "AUDIOHAL_MAX_CHANNEL_FAILURES";
pub const EVENT_QUEUE_LIMIT_ENV: &str = "AUDIOHAL_EVENT_QUEUE_LIMIT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HalOptions {
    /// Missing channels tolerated while scanning for volume controls.
    pub max_channel_failures: u32,
    /// Pending change events kept before the oldest is dropped.
    pub event_queue_limit: usize,
}

impl Default for HalOptions {
    fn default() -> Self {
        Self {
            max_channel_failures: 3,
            event_queue_limit: 1024,
        }
    }
}

impl HalOptions {
    /// Defaults overridden by `AUDIOHAL_*` variables that parse.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    pub fn with_env(self) -> Self {
        self.with_vars(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up through `var`, which plays the role of the
    /// process environment.
    pub fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = number(&var, MAX_CHANNEL_FAILURES_ENV) {
            self.max_channel_failures = v;
        }
        if let Some(v) = number(&var, EVENT_QUEUE_LIMIT_ENV) {
            self.event_queue_limit = v;
        }
        self
    }
}

pub fn env_flag(key: &str) -> bool {
    flag(|key| std::env::var(key).ok(), key)
}

pub fn flag(var: impl Fn(&str) -> Option<String>, key: &str) -> bool {
    var(key).map(|v| parse_flag(&v)).unwrap_or(false)
}

pub fn parse_flag(value: &str) -> bool {
    let s = value.trim().to_ascii_lowercase();
    s == "1" || s == "true" || s == "yes" || s == "on"
}

fn number<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring {key}={raw:?}: not a number");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_common_spellings() {
        for on in ["1", "true", "YES", " on "] {
            assert!(parse_flag(on), "{on}");
        }
        for off in ["0", "false", "", "enabled"] {
            assert!(!parse_flag(off), "{off}");
        }
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    #[test]
    fn numeric_overrides_apply() {
        let options = HalOptions::default().with_vars(vars(&[
            (MAX_CHANNEL_FAILURES_ENV, "7"),
            (EVENT_QUEUE_LIMIT_ENV, " 16 "),
        ]));
        assert_eq!(options.max_channel_failures, 7);
        assert_eq!(options.event_queue_limit, 16);
    }

    #[test]
    fn unparsable_overrides_are_ignored() {
        let options = HalOptions::default().with_vars(vars(&[
            (MAX_CHANNEL_FAILURES_ENV, "many"),
            (EVENT_QUEUE_LIMIT_ENV, "-1"),
        ]));
        assert_eq!(options, HalOptions::default());
    }

    #[test]
    fn missing_flag_is_off() {
        assert!(!flag(vars(&[]), "AUDIOHAL_JSON"));
        assert!(flag(vars(&[("AUDIOHAL_JSON", "yes")]), "AUDIOHAL_JSON"));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let options: HalOptions = serde_json::from_str(r#"{"event_queue_limit": 8}"#).unwrap();
        assert_eq!(options.event_queue_limit, 8);
        assert_eq!(options.max_channel_failures, 3);
    }
}
