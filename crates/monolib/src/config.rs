use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Engine tuning shared by the reader, conversion and output stages.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Capacity of the hand-off queue, in seconds of output audio.
    pub buffer_seconds: f32,
    /// Audio queued before the session reports `Playing`.
    pub prebuffer_seconds: f32,
    /// Resampler chunk size in frames.
    pub chunk_frames: usize,
    /// Max frames pulled per output callback refill.
    pub refill_max_frames: usize,
    pub connect_timeout: Duration,
    /// Read timeout while negotiating; the stream itself is read without one.
    pub handshake_timeout: Duration,
    /// Preferred device sample rate; `None` takes the highest the device supports.
    pub output_rate: Option<u32>,
    /// Case-insensitive substring of the output device name; `None` is the host default.
    pub device: Option<String>,
    /// Repeating XOR key the server applies to the stream after a successful request.
    pub xor_key: Option<Arc<[u8]>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: 2.0,
            prebuffer_seconds: 0.5,
            chunk_frames: 1024,
            refill_max_frames: 4096,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            output_rate: None,
            device: None,
            xor_key: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `MONOLIB_DEVICE`, `MONOLIB_BUFFER_SECONDS`,
    /// `MONOLIB_PREBUFFER_SECONDS` and `MONOLIB_XOR_KEY_FILE`. Unusable values are logged
    /// and ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::from_lookup(|key| std::env::var(key).ok());
        if let Ok(path) = std::env::var("MONOLIB_XOR_KEY_FILE") {
            match load_xor_key(Path::new(&path)) {
                Ok(key) => cfg.xor_key = Some(key),
                Err(e) => tracing::warn!(path = %path, error = %e, "ignoring XOR key file"),
            }
        }
        cfg
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(device) = lookup("MONOLIB_DEVICE").filter(|d| !d.trim().is_empty()) {
            cfg.device = Some(device);
        }
        if let Some(secs) = parse_seconds(&lookup, "MONOLIB_BUFFER_SECONDS") {
            cfg.buffer_seconds = secs;
        }
        if let Some(secs) = parse_seconds(&lookup, "MONOLIB_PREBUFFER_SECONDS") {
            cfg.prebuffer_seconds = secs;
        }
        cfg
    }
}

/// Read a whole file as an XOR key. An empty key is rejected.
pub fn load_xor_key(path: &Path) -> EngineResult<Arc<[u8]>> {
    let bytes = std::fs::read(path)
        .map_err(|e| EngineError::InvalidSettings(format!("read XOR key {}: {e}", path.display())))?;
    if bytes.is_empty() {
        return Err(EngineError::InvalidSettings(format!("XOR key {} is empty", path.display())));
    }
    Ok(Arc::from(bytes))
}

fn parse_seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<f32> {
    let raw = lookup(key)?;
    match raw.trim().parse::<f32>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Some(v),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring invalid duration");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_env() {
        let cfg = EngineConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg.buffer_seconds, 2.0);
        assert_eq!(cfg.prebuffer_seconds, 0.5);
        assert!(cfg.device.is_none());
    }

    #[test]
    fn env_overrides_are_applied() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("MONOLIB_DEVICE", "USB DAC"),
            ("MONOLIB_BUFFER_SECONDS", "4"),
            ("MONOLIB_PREBUFFER_SECONDS", " 0.25 "),
        ]));
        assert_eq!(cfg.device.as_deref(), Some("USB DAC"));
        assert_eq!(cfg.buffer_seconds, 4.0);
        assert_eq!(cfg.prebuffer_seconds, 0.25);
    }

    #[test]
    fn xor_key_is_read_whole_and_must_not_be_empty() {
        let dir = std::env::temp_dir().join(format!("monolib-key-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let key_path = dir.join("stream.key");
        std::fs::write(&key_path, [0x5a, 0x00, 0xff]).unwrap();
        assert_eq!(&*load_xor_key(&key_path).unwrap(), &[0x5a, 0x00, 0xff]);

        let empty_path = dir.join("empty.key");
        std::fs::write(&empty_path, b"").unwrap();
        assert!(matches!(load_xor_key(&empty_path), Err(EngineError::InvalidSettings(_))));
        assert!(matches!(
            load_xor_key(&dir.join("missing.key")),
            Err(EngineError::InvalidSettings(_))
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn invalid_values_are_ignored() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("MONOLIB_DEVICE", "  "),
            ("MONOLIB_BUFFER_SECONDS", "lots"),
            ("MONOLIB_PREBUFFER_SECONDS", "-1"),
        ]));
        assert!(cfg.device.is_none());
        assert_eq!(cfg.buffer_seconds, 2.0);
        assert_eq!(cfg.prebuffer_seconds, 0.5);
    }
}
