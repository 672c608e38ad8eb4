//! SFU Configuration

use huddle_proto::MediaKind;
use serde::{Deserialize, Serialize};

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Codecs offered by every room's router
    pub media_codecs: Vec<CodecConfig>,
    /// IP address announced in ICE candidates
    pub announced_ip: String,
    /// First port of the RTC port range
    pub rtc_min_port: u16,
    /// Last port of the RTC port range
    pub rtc_max_port: u16,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_rooms: 0,
            max_peers_per_room: 50,
            media_codecs: vec![
                CodecConfig {
                    kind: MediaKind::Audio,
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: Some(2),
                },
                CodecConfig {
                    kind: MediaKind::Video,
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    channels: None,
                },
                CodecConfig {
                    kind: MediaKind::Video,
                    mime_type: "video/H264".to_string(),
                    clock_rate: 90000,
                    channels: None,
                },
            ],
            announced_ip: "127.0.0.1".to_string(),
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}

impl SfuConfig {
    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.media_codecs.is_empty() {
            errors.push("sfu.media_codecs must list at least one codec".to_string());
        }
        if self.rtc_min_port == 0 || self.rtc_min_port > self.rtc_max_port {
            errors.push(format!(
                "sfu.rtc port range {}-{} is invalid",
                self.rtc_min_port, self.rtc_max_port
            ));
        }
        if self.announced_ip.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!(
                "sfu.announced_ip '{}' is not an IP address",
                self.announced_ip
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// One codec entry of the router capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SfuConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_port_range() {
        let config = SfuConfig {
            rtc_min_port: 5000,
            rtc_max_port: 4000,
            ..SfuConfig::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("port range"));
    }
}
