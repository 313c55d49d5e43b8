//! Audio device enumeration and selection

use cpal::traits::{DeviceTrait, HostTrait};

use crate::config::DeviceSelector;
use crate::error::AudioError;

/// Summary of one audio endpoint
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub max_channels: u16,
}

/// List all available audio devices.
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let is_default = default_input_name.as_ref() == Some(&name);
                devices.push(AudioDeviceInfo {
                    max_channels: max_config_channels(device.supported_input_configs().ok()),
                    name,
                    is_input: true,
                    is_output: false,
                    is_default,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);
                let max_channels = max_config_channels(device.supported_output_configs().ok());
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default = existing.is_default || is_default;
                    existing.max_channels = existing.max_channels.max(max_channels);
                } else {
                    devices.push(AudioDeviceInfo {
                        name,
                        is_input: false,
                        is_output: true,
                        is_default,
                        max_channels,
                    });
                }
            }
        }
    }

    devices
}

fn max_config_channels<I>(configs: Option<I>) -> u16
where
    I: Iterator<Item = cpal::SupportedStreamConfigRange>,
{
    configs
        .map(|iter| iter.map(|c| c.channels()).max().unwrap_or(0))
        .unwrap_or(0)
}

/// Highest channel count any output configuration of the device reports
pub fn max_output_channels(device: &cpal::Device) -> u16 {
    max_config_channels(device.supported_output_configs().ok())
}

/// Pick the render endpoint for playback.
///
/// Priority: exact identifier, then case-insensitive friendly-name
/// substring, then the system default, then the first available device.
/// Each fallback step is logged so an unexpected device choice can be
/// traced.
pub fn select_render_device(
    selector: &DeviceSelector,
) -> Result<(cpal::Device, String), AudioError> {
    let host = cpal::default_host();
    let devices: Vec<cpal::Device> = host
        .output_devices()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
        .collect();

    if devices.is_empty() {
        return Err(AudioError::DeviceNotFound(
            "no active render devices were found".into(),
        ));
    }

    match selector {
        DeviceSelector::ExactId(id) => {
            for device in devices {
                if device.name().map(|n| n == *id).unwrap_or(false) {
                    return Ok((device, id.clone()));
                }
            }
            Err(AudioError::DeviceNotFound(format!(
                "no render device matched id \"{id}\""
            )))
        }
        DeviceSelector::NameSubstring(substring) => {
            let needle = substring.to_lowercase();
            let mut remaining = Vec::with_capacity(devices.len());
            let mut matched = None;
            for device in devices {
                if matched.is_none() {
                    if let Ok(name) = device.name() {
                        if name.to_lowercase().contains(&needle) {
                            matched = Some((device, name));
                            continue;
                        }
                    }
                }
                remaining.push(device);
            }
            if let Some(found) = matched {
                return Ok(found);
            }
            tracing::warn!(
                substring = %substring,
                "preferred device substring not found; falling back to default render device"
            );
            default_or_first(remaining)
        }
        DeviceSelector::SystemDefault => default_or_first(devices),
    }
}

fn default_or_first(devices: Vec<cpal::Device>) -> Result<(cpal::Device, String), AudioError> {
    let host = cpal::default_host();
    if let Some(device) = host.default_output_device() {
        if let Ok(name) = device.name() {
            return Ok((device, name));
        }
    }
    tracing::warn!("no default render device; falling back to the first available");
    for device in devices {
        if let Ok(name) = device.name() {
            return Ok((device, name));
        }
    }
    Err(AudioError::DeviceNotFound(
        "no render device with a readable name".into(),
    ))
}

/// Liveness check used by the disconnect monitor.
pub fn is_output_device_present(name: &str) -> bool {
    let host = cpal::default_host();
    match host.output_devices() {
        Ok(mut devices) => {
            devices.any(|device| device.name().map(|n| n == name).unwrap_or(false))
        }
        Err(_) => false,
    }
}

/// Pick the capture endpoint for the sender.
///
/// A preferred label matches by case-insensitive substring; otherwise the
/// system default input is used.
pub fn select_capture_device(
    preferred: Option<&str>,
) -> Result<(cpal::Device, String), AudioError> {
    let host = cpal::default_host();

    if let Some(preferred) = preferred {
        let needle = preferred.to_lowercase();
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
        for device in devices {
            if let Ok(name) = device.name() {
                if name.to_lowercase().contains(&needle) {
                    return Ok((device, name));
                }
            }
        }
        tracing::warn!(
            preferred = %preferred,
            "preferred capture device not found; falling back to default input"
        );
    }

    let device = host
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceNotFound("no default input device".into()))?;
    let name = device
        .name()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
    Ok((device, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Device-dependent paths can only be smoke-tested; CI machines may
    // expose no audio endpoints at all.
    #[test]
    fn test_list_devices_does_not_panic() {
        let _ = list_devices();
    }

    #[test]
    fn test_missing_exact_id_is_an_error() {
        let selector = DeviceSelector::ExactId("no-such-device-identifier".into());
        match select_render_device(&selector) {
            Err(AudioError::DeviceNotFound(_)) => {}
            Ok((_, name)) => panic!("unexpected device match: {name}"),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
