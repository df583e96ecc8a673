//! Boot parameters parsed from the kernel command line.
//!
//! Every field has a default, so a missing or malformed parameter never
//! blocks a boot. The set is built once and then shared by reference with
//! every supervisor phase.

use crate::wire::Credentials;
use serde::{Deserialize, Serialize};

/// Default time source.
pub const DEFAULT_NTP_SERVER: &str = "pool.ntp.org";

/// Requested remote-desktop resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Fullscreen,
    Fixed { width: u32, height: u32 },
}

impl Default for Resolution {
    fn default() -> Self {
        Self::Fullscreen
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "fullscreen" {
            return Ok(Self::Fullscreen);
        }
        let (w, h) = s
            .split_once('x')
            .ok_or_else(|| format!("invalid resolution: '{}'", s))?;
        let width: u32 = w.parse().map_err(|_| format!("invalid width: '{}'", w))?;
        let height: u32 = h.parse().map_err(|_| format!("invalid height: '{}'", h))?;
        if width == 0 || height == 0 {
            return Err(format!("invalid resolution: '{}'", s));
        }
        Ok(Self::Fixed { width, height })
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fullscreen => write!(f, "fullscreen"),
            Self::Fixed { width, height } => write!(f, "{}x{}", width, height),
        }
    }
}

/// Per-peripheral redirection switches for the remote-desktop client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralFlags {
    pub sound: bool,
    pub printer: bool,
    pub usb: bool,
    pub clipboard: bool,
    pub drives: bool,
    pub compression: bool,
    pub multimon: bool,
}

impl Default for PeripheralFlags {
    fn default() -> Self {
        Self {
            sound: true,
            printer: false,
            usb: false,
            clipboard: true,
            drives: false,
            compression: true,
            multimon: false,
        }
    }
}

/// Everything the supervisor learns from the kernel command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootParameterSet {
    /// Address of the central server (`serverip`).
    pub server_ip: Option<String>,
    /// Credentials from `rdserver`, `rdpdomain`, `rdpuser`, `rdppass`.
    pub credentials: Credentials,
    /// One-time token exchanged for credentials (`boottoken`).
    pub boot_token: Option<String>,
    pub ntp_server: String,
    pub resolution: Resolution,
    pub peripherals: PeripheralFlags,
    /// Run the network print server (`printserver`).
    pub print_server: bool,
    /// Video driver configured on the server (`videodriver`).
    pub video_driver: Option<String>,
    /// Display driver forced for a single attempt (`xorg_driver`).
    pub forced_display_driver: Option<String>,
    /// Password for the remote diagnostic shell (`sshpass`).
    pub ssh_password: Option<String>,
    /// Stop in the emergency shell after bring-up (`shell`, `emergency`, `debug`).
    pub force_shell: bool,
    pub verbose: bool,
}

impl Default for BootParameterSet {
    fn default() -> Self {
        Self {
            server_ip: None,
            credentials: Credentials::default(),
            boot_token: None,
            ntp_server: DEFAULT_NTP_SERVER.to_string(),
            resolution: Resolution::Fullscreen,
            peripherals: PeripheralFlags::default(),
            print_server: false,
            video_driver: None,
            forced_display_driver: None,
            ssh_password: None,
            force_shell: false,
            verbose: false,
        }
    }
}

impl BootParameterSet {
    /// Parse a kernel command line. Unknown keys are ignored.
    pub fn parse(cmdline: &str) -> Self {
        let mut params = Self::default();
        for token in split_cmdline(cmdline) {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (token.as_str(), None),
            };
            params.apply(key, value);
        }
        params
    }

    fn apply(&mut self, key: &str, value: Option<&str>) {
        let text = || value.map(str::trim).filter(|v| !v.is_empty()).map(String::from);
        match key {
            "serverip" => self.server_ip = text(),
            "rdserver" => self.credentials.server = text(),
            "rdpdomain" => self.credentials.domain = text(),
            "rdpuser" => self.credentials.username = text(),
            "rdppass" => self.credentials.password = text(),
            "boottoken" => self.boot_token = text(),
            "ntpserver" => {
                if let Some(v) = text() {
                    self.ntp_server = v;
                }
            }
            "resolution" => {
                if let Some(v) = value {
                    match v.parse() {
                        Ok(r) => self.resolution = r,
                        Err(e) => tracing::warn!(value = v, error = %e, "Ignoring resolution"),
                    }
                }
            }
            "sound" => flag(key, value, &mut self.peripherals.sound),
            "printer" => flag(key, value, &mut self.peripherals.printer),
            "usb" => flag(key, value, &mut self.peripherals.usb),
            "clipboard" => flag(key, value, &mut self.peripherals.clipboard),
            "drives" => flag(key, value, &mut self.peripherals.drives),
            "compression" => flag(key, value, &mut self.peripherals.compression),
            "multimon" => flag(key, value, &mut self.peripherals.multimon),
            "printserver" => flag(key, value, &mut self.print_server),
            "videodriver" => self.video_driver = text(),
            "xorg_driver" => self.forced_display_driver = text(),
            "sshpass" => self.ssh_password = text(),
            "shell" | "emergency" | "debug" => match value {
                None => self.force_shell = true,
                Some(_) => flag(key, value, &mut self.force_shell),
            },
            "verbose" => match value {
                None => self.verbose = true,
                Some(_) => flag(key, value, &mut self.verbose),
            },
            _ => {}
        }
    }

    /// Whether any credentials source is available for the session.
    pub fn has_session_target(&self) -> bool {
        self.credentials.server.is_some() || self.boot_token.is_some()
    }
}

fn flag(key: &str, value: Option<&str>, slot: &mut bool) {
    match value.map(parse_bool) {
        Some(Some(b)) => *slot = b,
        _ => tracing::warn!(
            key,
            value = value.unwrap_or(""),
            default = *slot,
            "Malformed boolean boot parameter, keeping default"
        ),
    }
}

/// Parse `yes/no/1/0/true/false/on/off`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "yes" | "1" | "true" | "on" => Some(true),
        "no" | "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Split a kernel command line on whitespace, honoring double quotes.
fn split_cmdline(cmdline: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in cmdline.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_applies_defaults() {
        let params = BootParameterSet::parse(
            "serverip=192.168.1.10 rdserver=rds.local rdpuser=alice sound=yes",
        );
        assert_eq!(params.server_ip.as_deref(), Some("192.168.1.10"));
        assert_eq!(params.credentials.server.as_deref(), Some("rds.local"));
        assert_eq!(params.credentials.username.as_deref(), Some("alice"));
        assert!(params.peripherals.sound);
        assert!(!params.peripherals.printer);
        assert!(!params.peripherals.usb);
        assert_eq!(params.resolution, Resolution::Fullscreen);
        assert!(params.boot_token.is_none());
        assert_eq!(params.ntp_server, DEFAULT_NTP_SERVER);
        assert!(!params.force_shell);
    }

    #[test]
    fn test_parse_empty_cmdline_is_default() {
        assert_eq!(BootParameterSet::parse(""), BootParameterSet::default());
    }

    #[test]
    fn test_parse_full_cmdline() {
        let params = BootParameterSet::parse(
            "init=/init rw serverip=10.0.0.1 rdserver=rds.corp ntpserver=ntp.corp \
             rdpdomain=CORP rdpuser=bob boottoken=abc123 resolution=1920x1080 \
             sound=no printer=yes usb=1 clipboard=off drives=true compression=0 \
             multimon=on printserver=yes videodriver=intel xorg_driver=fbdev \
             sshpass=diag verbose=yes",
        );
        assert_eq!(params.ntp_server, "ntp.corp");
        assert_eq!(params.credentials.domain.as_deref(), Some("CORP"));
        assert_eq!(params.boot_token.as_deref(), Some("abc123"));
        assert_eq!(
            params.resolution,
            Resolution::Fixed {
                width: 1920,
                height: 1080
            }
        );
        assert_eq!(
            params.peripherals,
            PeripheralFlags {
                sound: false,
                printer: true,
                usb: true,
                clipboard: false,
                drives: true,
                compression: false,
                multimon: true,
            }
        );
        assert!(params.print_server);
        assert_eq!(params.video_driver.as_deref(), Some("intel"));
        assert_eq!(params.forced_display_driver.as_deref(), Some("fbdev"));
        assert_eq!(params.ssh_password.as_deref(), Some("diag"));
        assert!(params.verbose);
    }

    #[test]
    fn test_malformed_values_keep_defaults() {
        let params = BootParameterSet::parse("sound=maybe printer=sure resolution=huge");
        assert!(params.peripherals.sound);
        assert!(!params.peripherals.printer);
        assert_eq!(params.resolution, Resolution::Fullscreen);
    }

    #[test]
    fn test_bare_shell_flags() {
        for word in ["shell", "emergency", "debug"] {
            let params = BootParameterSet::parse(&format!("quiet {}", word));
            assert!(params.force_shell, "{}", word);
        }
        assert!(BootParameterSet::parse("verbose").verbose);
        assert!(!BootParameterSet::parse("debug=no").force_shell);
    }

    #[test]
    fn test_empty_values_are_unset() {
        let params = BootParameterSet::parse("boottoken= rdserver=");
        assert!(params.boot_token.is_none());
        assert!(params.credentials.server.is_none());
        assert!(!params.has_session_target());
    }

    #[test]
    fn test_quoted_values() {
        let params = BootParameterSet::parse("rdpdomain=\"MY CORP\" rdpuser=alice");
        assert_eq!(params.credentials.domain.as_deref(), Some("MY CORP"));
        assert_eq!(params.credentials.username.as_deref(), Some("alice"));
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!("FULLSCREEN".parse::<Resolution>().unwrap(), Resolution::Fullscreen);
        assert_eq!(
            "1280x1024".parse::<Resolution>().unwrap().to_string(),
            "1280x1024"
        );
        assert!("0x600".parse::<Resolution>().is_err());
        assert!("wide".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_parse_bool() {
        for v in ["yes", "1", "true", "on", "YES"] {
            assert_eq!(parse_bool(v), Some(true));
        }
        for v in ["no", "0", "false", "off"] {
            assert_eq!(parse_bool(v), Some(false));
        }
        assert_eq!(parse_bool("maybe"), None);
    }
}
