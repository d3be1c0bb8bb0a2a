use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};

/// Environment toggle that allows (or forbids) running on a CUDA device.
pub const USE_CUDA_ENV: &str = "RTLGEN_USE_CUDA";
/// Environment toggle that allows (or forbids) running on a Metal device.
pub const USE_METAL_ENV: &str = "RTLGEN_USE_METAL";

/// Which numerical backends the model stack may use.
///
/// Both backends are allowed by default. The first allowed backend that is
/// compiled in and present on the machine wins, falling back to the CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendPreference {
    /// Allow a CUDA device.
    pub cuda: bool,
    /// Allow a Metal device.
    pub metal: bool,
}

impl Default for BackendPreference {
    fn default() -> Self {
        Self {
            cuda: true,
            metal: true,
        }
    }
}

impl BackendPreference {
    /// Only ever run on the CPU.
    pub fn cpu_only() -> Self {
        Self {
            cuda: false,
            metal: false,
        }
    }

    /// Read the preference from [`USE_CUDA_ENV`] and [`USE_METAL_ENV`].
    ///
    /// Unset or unrecognized values leave the backend enabled.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let toggle = |key: &str| {
            let value = lookup(key)?;
            let parsed = parse_toggle(&value);
            if parsed.is_none() {
                tracing::warn!("Ignoring unrecognized value {value:?} for {key}");
            }
            parsed
        };
        let default = Self::default();
        Self {
            cuda: toggle(USE_CUDA_ENV).unwrap_or(default.cuda),
            metal: toggle(USE_METAL_ENV).unwrap_or(default.metal),
        }
    }

    /// Create the device for this preference.
    pub fn device(&self) -> candle_core::Result<Device> {
        let device = if self.cuda && cuda_is_available() {
            Device::new_cuda(0)?
        } else if self.metal && metal_is_available() {
            Device::new_metal(0)?
        } else {
            if self.cuda || self.metal {
                tracing::info!("No accelerator available, running on CPU. Build with `--features cuda` or `--features metal` to use a GPU");
            }
            Device::Cpu
        };
        tracing::debug!("Selected device {device:?}");
        Ok(device)
    }
}

/// Parse a boolean-like environment value.
pub fn parse_toggle(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn toggles_accept_common_spellings() {
        for value in ["1", "true", "TRUE", " yes ", "On"] {
            assert_eq!(parse_toggle(value), Some(true), "{value}");
        }
        for value in ["0", "false", "No", "OFF"] {
            assert_eq!(parse_toggle(value), Some(false), "{value}");
        }
        assert_eq!(parse_toggle("maybe"), None);
        assert_eq!(parse_toggle(""), None);
    }

    #[test]
    fn preference_reads_both_toggles() {
        let env = HashMap::from([
            (USE_CUDA_ENV, "0".to_string()),
            (USE_METAL_ENV, "1".to_string()),
        ]);
        let preference = BackendPreference::from_lookup(|key| env.get(key).cloned());
        assert_eq!(
            preference,
            BackendPreference {
                cuda: false,
                metal: true
            }
        );
    }

    #[test]
    fn unset_toggles_keep_accelerators_enabled() {
        let preference = BackendPreference::from_lookup(|_| None);
        assert_eq!(preference, BackendPreference::default());

        let preference = BackendPreference::from_lookup(|_| Some("garbage".to_string()));
        assert_eq!(preference, BackendPreference::default());
    }

    #[test]
    fn cpu_only_runs_on_cpu() {
        let device = BackendPreference::cpu_only().device().unwrap();
        assert!(device.is_cpu());
    }
}
