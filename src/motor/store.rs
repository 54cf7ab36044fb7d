// Persistent per-motor calibration records
//
// Records are opaque blobs addressed by (namespace, key). Each motor owns the
// namespace "MtrCtrl-<channel>" and stores its calibration under "calib_data".

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{pwm_from_pulse_us, NEUTRAL_PWM};
use crate::error::{Error, Result};

pub const CALIBRATION_KEY: &str = "calib_data";

/// Store namespace of a motor channel
pub fn motor_namespace(channel: u8) -> String {
    format!("MtrCtrl-{}", channel)
}

/// Calibration of one servo: PWM travel, matching feedback voltages, noise and timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationData {
    pub min_pwm: u16,
    pub max_pwm: u16,
    pub min_voltage: i32,
    pub max_voltage: i32,
    pub feedback_noise: i32,
    pub pwm_deadband: u16,
    pub feedback_latency_ms: u16,
}

/// Used until a motor has been calibrated: full 0.5-2.5 ms pulse range
pub const DEFAULT_CALIBRATION: CalibrationData = CalibrationData {
    min_pwm: pwm_from_pulse_us(500),
    max_pwm: pwm_from_pulse_us(2500),
    min_voltage: 200,
    max_voltage: 3000,
    feedback_noise: 1,
    pwm_deadband: 1,
    feedback_latency_ms: 0,
};

impl CalibrationData {
    /// Size of the persisted record
    pub const ENCODED_LEN: usize = 20;

    /// Little-endian layout: min_pwm u16, max_pwm u16, min_voltage i32,
    /// max_voltage i32, feedback_noise i32, pwm_deadband u16, feedback_latency_ms u16
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..2].copy_from_slice(&self.min_pwm.to_le_bytes());
        out[2..4].copy_from_slice(&self.max_pwm.to_le_bytes());
        out[4..8].copy_from_slice(&self.min_voltage.to_le_bytes());
        out[8..12].copy_from_slice(&self.max_voltage.to_le_bytes());
        out[12..16].copy_from_slice(&self.feedback_noise.to_le_bytes());
        out[16..18].copy_from_slice(&self.pwm_deadband.to_le_bytes());
        out[18..20].copy_from_slice(&self.feedback_latency_ms.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(Error::InvalidParameters(format!(
                "Calibration record is {} bytes, expected {}",
                bytes.len(),
                Self::ENCODED_LEN
            )));
        }
        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let i32_at =
            |i: usize| i32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Ok(Self {
            min_pwm: u16_at(0),
            max_pwm: u16_at(2),
            min_voltage: i32_at(4),
            max_voltage: i32_at(8),
            feedback_noise: i32_at(12),
            pwm_deadband: u16_at(16),
            feedback_latency_ms: u16_at(18),
        })
    }

    /// min < max for both PWM and voltage
    pub fn is_consistent(&self) -> bool {
        self.min_pwm < self.max_pwm && self.min_voltage < self.max_voltage
    }

    /// PWM for a normalized position in [0, 1]
    pub fn pwm_for_ratio(&self, ratio: f32) -> u16 {
        let span = self.max_pwm as f32 - self.min_pwm as f32;
        (self.min_pwm as f32 + ratio * span) as u16
    }

    /// Normalized position for a feedback voltage. Not clamped: readings at or past
    /// a calibrated bound map slightly outside [0, 1].
    pub fn ratio_for_voltage(&self, millivolts: i32) -> f32 {
        (millivolts - self.min_voltage) as f32 / (self.max_voltage - self.min_voltage) as f32
    }
}

impl Default for CalibrationData {
    fn default() -> Self {
        DEFAULT_CALIBRATION
    }
}

// neutral must sit inside the default travel
const _: () = assert!(NEUTRAL_PWM > DEFAULT_CALIBRATION.min_pwm);

/// Blob store for calibration records
pub trait CalibrationStore: Send + Sync {
    /// Fetch a blob, `NotFound` when absent
    fn get(&self, namespace: &str, key: &str) -> Result<Vec<u8>>;

    fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()>;

    fn erase(&self, namespace: &str, key: &str) -> Result<()>;
}

/// Load the calibration record of a motor, if any
pub fn load_calibration(store: &dyn CalibrationStore, channel: u8) -> Result<CalibrationData> {
    let blob = store.get(&motor_namespace(channel), CALIBRATION_KEY)?;
    CalibrationData::from_bytes(&blob)
}

pub fn save_calibration(
    store: &dyn CalibrationStore,
    channel: u8,
    data: &CalibrationData,
) -> Result<()> {
    store.set(&motor_namespace(channel), CALIBRATION_KEY, &data.to_bytes())
}

/// Volatile store, also used to inject write failures in tests
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
    read_only: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `HardwareFailure`
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::HardwareFailure("store is read-only".to_string()));
        }
        Ok(())
    }
}

impl CalibrationStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Vec<u8>> {
        self.entries
            .lock()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{}/{}", namespace, key)))
    }

    fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.entries
            .lock()
            .insert((namespace.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    fn erase(&self, namespace: &str, key: &str) -> Result<()> {
        self.check_writable()?;
        self.entries
            .lock()
            .remove(&(namespace.to_string(), key.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("{}/{}", namespace, key)))
    }
}

type Namespaces = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// Store persisted as one JSON document, rewritten on every change
pub struct JsonFileStore {
    path: PathBuf,
    namespaces: Mutex<Namespaces>,
}

impl JsonFileStore {
    /// Open the store, starting empty when the file does not exist yet
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let namespaces = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let parsed: Namespaces = serde_json::from_str(&text)?;
            info!("Loaded {} calibration namespaces from {}", parsed.len(), path.display());
            parsed
        } else {
            info!("No calibration store at {}, starting empty", path.display());
            Namespaces::new()
        };
        Ok(Self {
            path,
            namespaces: Mutex::new(namespaces),
        })
    }

    fn persist(&self, namespaces: &Namespaces) -> Result<()> {
        let text = serde_json::to_string_pretty(namespaces)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("Calibration store written to {}", self.path.display());
        Ok(())
    }
}

impl CalibrationStore for JsonFileStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Vec<u8>> {
        self.namespaces
            .lock()
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{}/{}", namespace, key)))
    }

    fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut namespaces = self.namespaces.lock();
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        self.persist(&namespaces)
    }

    fn erase(&self, namespace: &str, key: &str) -> Result<()> {
        let mut namespaces = self.namespaces.lock();
        let removed = namespaces
            .get_mut(namespace)
            .and_then(|entries| entries.remove(key))
            .is_some();
        if !removed {
            return Err(Error::NotFound(format!("{}/{}", namespace, key)));
        }
        self.persist(&namespaces)
    }
}
