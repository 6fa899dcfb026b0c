//! Cache configuration: watermarks, keep-alive, and the ways they arrive
//! (config string, property store, request headers).

use std::collections::HashMap;
use std::time::Duration;

use log::warn;
use thiserror::Error;

/// Above this many cached bytes the fetcher pauses.
pub const DEFAULT_HIGH_WATER_BYTES: usize = 20 * 1024 * 1024;
/// Below this many bytes buffered ahead of the reader the fetcher resumes.
pub const DEFAULT_LOW_WATER_BYTES: usize = 4 * 1024 * 1024;
/// How often to issue a single read while idle, to keep the connection warm.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Preferred property key for cache parameters (persists across reboots).
pub const PERSISTENT_PARAMS_PROPERTY: &str = "persist.sys.media.cache-params";
/// Fallback property key for cache parameters.
pub const PARAMS_PROPERTY: &str = "media.stagefright.cache-params";

/// Request header carrying a cache parameter string.
pub const CACHE_CONFIG_HEADER: &str = "x-cache-config";
/// Request header asking for the connection to be dropped at high water.
pub const DISCONNECT_AT_HIGH_WATER_HEADER: &str = "x-disconnect-at-highwatermark";

/// Error for configuration parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("malformed cache parameters '{0}', expected 'lowKB/highKB/keepAliveSecs'")]
    Malformed(String),
}

/// Runtime-adjustable cache parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Fetcher pauses once the window holds this many bytes.
    pub high_water_bytes: usize,
    /// Fetcher resumes once fewer than this many bytes are buffered ahead
    /// of the reader.
    pub low_water_bytes: usize,
    /// Interval between idle keep-alive reads. Zero disables keep-alive.
    pub keep_alive_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            high_water_bytes: DEFAULT_HIGH_WATER_BYTES,
            low_water_bytes: DEFAULT_LOW_WATER_BYTES,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
        }
    }
}

impl CacheConfig {
    /// Applies a `"lowKB/highKB/keepAliveSecs"` parameter string. A negative
    /// field selects that field's default. Illegal watermarks (low >= high)
    /// revert both watermarks to their defaults.
    ///
    /// On a malformed string the configuration is left untouched.
    pub fn update_from_str(&mut self, s: &str) -> Result<(), ConfigError> {
        let malformed = || ConfigError::Malformed(s.to_string());

        let fields: Vec<i64> = s
            .split('/')
            .map(|f| f.trim().parse::<i64>())
            .collect::<Result<_, _>>()
            .map_err(|_| malformed())?;
        let [low_kb, high_kb, keep_alive_secs]: [i64; 3] =
            fields.try_into().map_err(|_| malformed())?;

        self.low_water_bytes = if low_kb >= 0 {
            low_kb as usize * 1024
        } else {
            DEFAULT_LOW_WATER_BYTES
        };

        self.high_water_bytes = if high_kb >= 0 {
            high_kb as usize * 1024
        } else {
            DEFAULT_HIGH_WATER_BYTES
        };

        if self.low_water_bytes >= self.high_water_bytes {
            warn!("illegal low/high watermarks in '{s}', reverting to defaults");
            self.low_water_bytes = DEFAULT_LOW_WATER_BYTES;
            self.high_water_bytes = DEFAULT_HIGH_WATER_BYTES;
        }

        self.keep_alive_interval = if keep_alive_secs >= 0 {
            Duration::from_secs(keep_alive_secs as u64)
        } else {
            DEFAULT_KEEP_ALIVE_INTERVAL
        };

        Ok(())
    }

    /// Applies cache parameters from a property store, trying
    /// [`PERSISTENT_PARAMS_PROPERTY`] first and [`PARAMS_PROPERTY`] second.
    /// Absent keys leave the configuration untouched.
    pub fn update_from_properties(
        &mut self,
        properties: &HashMap<String, String>,
    ) -> Result<(), ConfigError> {
        let value = properties
            .get(PERSISTENT_PARAMS_PROPERTY)
            .or_else(|| properties.get(PARAMS_PROPERTY));
        match value {
            Some(s) => self.update_from_str(s),
            None => Ok(()),
        }
    }
}

/// Cache directives extracted from a request-header map.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CacheHeaderOverrides {
    /// Parameter string from [`CACHE_CONFIG_HEADER`], if present.
    pub cache_config: Option<String>,
    /// True if [`DISCONNECT_AT_HIGH_WATER_HEADER`] was present.
    pub disconnect_at_high_water: bool,
}

/// Extracts the cache-specific entries from `headers`, removing them so the
/// map can be handed to the upstream source untouched by cache concerns.
pub fn remove_cache_specific_headers(
    headers: &mut HashMap<String, String>,
) -> CacheHeaderOverrides {
    CacheHeaderOverrides {
        cache_config: headers.remove(CACHE_CONFIG_HEADER),
        disconnect_at_high_water: headers.remove(DISCONNECT_AT_HIGH_WATER_HEADER).is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_from_str_parses_all_fields() {
        let mut config = CacheConfig::default();
        config.update_from_str("16/64/5").unwrap();

        assert_eq!(config.low_water_bytes, 16 * 1024);
        assert_eq!(config.high_water_bytes, 64 * 1024);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(5));
    }

    #[test]
    fn update_from_str_negative_fields_select_defaults() {
        let mut config = CacheConfig::default();
        config.update_from_str("-1/-1/-1").unwrap();
        assert_eq!(config, CacheConfig::default());

        config.update_from_str("16/-1/0").unwrap();
        assert_eq!(config.low_water_bytes, 16 * 1024);
        assert_eq!(config.high_water_bytes, DEFAULT_HIGH_WATER_BYTES);
        assert_eq!(config.keep_alive_interval, Duration::ZERO);
    }

    #[test]
    fn update_from_str_reverts_illegal_watermarks() {
        let mut config = CacheConfig::default();
        config.update_from_str("128/64/7").unwrap();

        // Both watermarks back to defaults, keep-alive keeps its value.
        assert_eq!(config.low_water_bytes, DEFAULT_LOW_WATER_BYTES);
        assert_eq!(config.high_water_bytes, DEFAULT_HIGH_WATER_BYTES);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(7));
    }

    #[test]
    fn update_from_str_rejects_malformed_input() {
        let mut config = CacheConfig::default();
        for s in ["", "16/64", "16/64/5/9", "a/b/c", "16//5"] {
            let err = config.update_from_str(s).unwrap_err();
            assert_eq!(err, ConfigError::Malformed(s.to_string()));
            assert_eq!(config, CacheConfig::default());
        }
    }

    #[test]
    fn update_from_properties_prefers_persistent_key() {
        let mut properties = HashMap::new();
        properties.insert(PERSISTENT_PARAMS_PROPERTY.to_string(), "16/64/1".to_string());
        properties.insert(PARAMS_PROPERTY.to_string(), "32/128/2".to_string());

        let mut config = CacheConfig::default();
        config.update_from_properties(&properties).unwrap();
        assert_eq!(config.low_water_bytes, 16 * 1024);

        properties.remove(PERSISTENT_PARAMS_PROPERTY);
        config.update_from_properties(&properties).unwrap();
        assert_eq!(config.low_water_bytes, 32 * 1024);
    }

    #[test]
    fn update_from_properties_without_keys_is_a_no_op() {
        let mut config = CacheConfig::default();
        config.update_from_properties(&HashMap::new()).unwrap();
        assert_eq!(config, CacheConfig::default());
    }

    #[test]
    fn remove_cache_specific_headers_strips_and_returns() {
        let mut headers = HashMap::new();
        headers.insert(CACHE_CONFIG_HEADER.to_string(), "16/64/5".to_string());
        headers.insert(
            DISCONNECT_AT_HIGH_WATER_HEADER.to_string(),
            "1".to_string(),
        );
        headers.insert("user-agent".to_string(), "demuxer/1.0".to_string());

        let overrides = remove_cache_specific_headers(&mut headers);

        assert_eq!(overrides.cache_config.as_deref(), Some("16/64/5"));
        assert!(overrides.disconnect_at_high_water);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("user-agent"));
    }

    #[test]
    fn remove_cache_specific_headers_handles_absent_keys() {
        let mut headers = HashMap::new();
        headers.insert("range".to_string(), "bytes=0-".to_string());

        let overrides = remove_cache_specific_headers(&mut headers);

        assert_eq!(overrides, CacheHeaderOverrides::default());
        assert_eq!(headers.len(), 1);
    }
}
