//! Process configuration, loaded from environment variables.
//!
//! Plain env vars, no config-file crate — covers the full knob set the
//! relay needs for room/session/protocol limits and transport settings.

use std::collections::HashMap;
use std::env;

/// Default relay capacity per room (spec default: 5).
const DEFAULT_CAPACITY: usize = 5;
const DEFAULT_MAX_ROOMS: usize = 1_000_000;
const DEFAULT_MAX_DOC_SIZE: usize = 10 * 1024 * 1024;
const DEFAULT_PROTOCOL_ERROR_THRESHOLD: u32 = 5;
const DEFAULT_ROOM_QUEUE: usize = 256;
const DEFAULT_SESSION_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the relay listens on.
    pub bind_addr: String,
    /// The single HTTP path that is upgraded to a WebSocket (e.g. `/yjs`).
    pub relay_path: String,
    /// Allowed `Origin` header values. Empty means: reject every request
    /// that carries an Origin header (see DESIGN.md Open Question 7).
    pub origin_allowlist: Vec<String>,
    /// Room name used when the `room` query parameter is absent.
    pub room_fallback: String,
    /// Maximum participants per room.
    pub capacity: usize,
    /// Maximum number of simultaneously live rooms.
    pub max_rooms: usize,
    /// Maximum serialized document size, in bytes.
    pub max_doc_size: usize,
    /// Number of protocol violations a session tolerates before it is closed.
    pub protocol_error_threshold: u32,
    /// Depth of a room's inbound command queue.
    pub room_queue_depth: usize,
    /// Depth of a session's outbound frame queue.
    pub session_queue_depth: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_map(&vars)
    }

    /// Pure parsing function, separated from process environment access so
    /// tests can exercise defaulting/override behaviour without mutating
    /// the real environment.
    pub fn from_map(vars: &HashMap<String, String>) -> Self {
        let get = |key: &str| vars.get(key).cloned();

        Self {
            bind_addr: get("RELAY_BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".into()),
            relay_path: get("RELAY_PATH").unwrap_or_else(|| "/yjs".into()),
            origin_allowlist: get("RELAY_ORIGIN_ALLOWLIST")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            room_fallback: get("RELAY_ROOM_FALLBACK").unwrap_or_else(|| "bytetogether".into()),
            capacity: get("RELAY_CAPACITY")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CAPACITY),
            max_rooms: get("RELAY_MAX_ROOMS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_ROOMS),
            max_doc_size: get("RELAY_MAX_DOC_SIZE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_DOC_SIZE),
            protocol_error_threshold: get("RELAY_PROTOCOL_ERROR_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_PROTOCOL_ERROR_THRESHOLD),
            room_queue_depth: get("RELAY_ROOM_QUEUE_DEPTH")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_ROOM_QUEUE),
            session_queue_depth: get("RELAY_SESSION_QUEUE_DEPTH")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SESSION_QUEUE),
        }
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.origin_allowlist.iter().any(|o| o == origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_with_empty_environment() {
        let config = Config::from_map(&HashMap::new());
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.relay_path, "/yjs");
        assert!(config.origin_allowlist.is_empty());
        assert_eq!(config.room_fallback, "bytetogether");
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.max_rooms, DEFAULT_MAX_ROOMS);
        assert_eq!(config.max_doc_size, DEFAULT_MAX_DOC_SIZE);
        assert_eq!(
            config.protocol_error_threshold,
            DEFAULT_PROTOCOL_ERROR_THRESHOLD
        );
    }

    #[test]
    fn parses_comma_separated_origin_allowlist() {
        let mut vars = HashMap::new();
        vars.insert(
            "RELAY_ORIGIN_ALLOWLIST".to_string(),
            "https://a.test, https://b.test,,".to_string(),
        );
        let config = Config::from_map(&vars);
        assert_eq!(config.origin_allowlist, vec!["https://a.test", "https://b.test"]);
        assert!(config.origin_allowed("https://a.test"));
        assert!(!config.origin_allowed("https://attacker.test"));
    }

    #[test]
    fn overrides_numeric_settings() {
        let mut vars = HashMap::new();
        vars.insert("RELAY_CAPACITY".to_string(), "2".to_string());
        vars.insert("RELAY_MAX_DOC_SIZE".to_string(), "100".to_string());
        let config = Config::from_map(&vars);
        assert_eq!(config.capacity, 2);
        assert_eq!(config.max_doc_size, 100);
    }

    #[test]
    fn ignores_unparseable_numeric_override() {
        let mut vars = HashMap::new();
        vars.insert("RELAY_CAPACITY".to_string(), "not-a-number".to_string());
        let config = Config::from_map(&vars);
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
    }
}
