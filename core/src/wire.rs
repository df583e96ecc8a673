//! Server HTTP API payloads and addressing.

use serde::{Deserialize, Deserializer, Serialize};

/// Remote-desktop credentials delivered in exchange for a boot token.
///
/// The server sends unset fields as empty strings; those decode as `None`.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "rdp_server", default, deserialize_with = "non_blank")]
    pub server: Option<String>,
    #[serde(rename = "rdp_domain", default, deserialize_with = "non_blank")]
    pub domain: Option<String>,
    #[serde(rename = "rdp_username", default, deserialize_with = "non_blank")]
    pub username: Option<String>,
    #[serde(rename = "rdp_password", default, deserialize_with = "non_blank")]
    pub password: Option<String>,
}

fn non_blank<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.trim().is_empty()))
}

fn first_present(preferred: &Option<String>, fallback: &Option<String>) -> Option<String> {
    preferred
        .iter()
        .chain(fallback.iter())
        .find(|s| !s.trim().is_empty())
        .cloned()
}

impl Credentials {
    /// Overlay `other` on top of `self`: every non-blank field in `other` wins.
    pub fn overridden_by(&self, other: &Credentials) -> Credentials {
        Credentials {
            server: first_present(&other.server, &self.server),
            domain: first_present(&other.domain, &self.domain),
            username: first_present(&other.username, &self.username),
            password: first_present(&other.password, &self.password),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("server", &self.server)
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Server API routes, relative to `http://<server>/api`.
pub mod routes {
    pub fn boot_script(mac: &str) -> String {
        format!("/boot/{}", mac)
    }

    pub fn credentials(token: &str) -> String {
        format!("/boot/credentials/{}", token)
    }

    pub const LOG_BATCH: &str = "/client-log/batch";

    pub fn heartbeat(mac: &str) -> String {
        format!("/heartbeat/{}", mac)
    }

    pub const METRICS: &str = "/metrics";

    pub fn diagnostic(mac: &str) -> String {
        format!("/diagnostic/{}", mac)
    }
}

/// Base URL of the server API for a bare host or address.
pub fn api_base(server: &str) -> String {
    let server = server.trim().trim_end_matches('/');
    if server.starts_with("http://") || server.starts_with("https://") {
        if server.ends_with("/api") {
            server.to_string()
        } else {
            format!("{}/api", server)
        }
    } else {
        format!("http://{}/api", server)
    }
}

/// Normalize a hardware address to upper-case colon-separated form.
///
/// Accepts colon, dash, or dot separators as well as bare hex digits.
/// Returns `None` unless exactly twelve hex digits are present.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let digits: String = mac
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();
    if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let upper = digits.to_uppercase();
    let pairs: Vec<&str> = (0..6).map(|i| &upper[i * 2..i * 2 + 2]).collect();
    Some(pairs.join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mac() {
        assert_eq!(
            normalize_mac("aa:bb:cc:dd:ee:ff").as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert_eq!(
            normalize_mac("aa-bb-cc-dd-ee-ff").as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert_eq!(
            normalize_mac("aabb.ccdd.eeff").as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert_eq!(normalize_mac("aabbccddeeff").as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert!(normalize_mac("aa:bb:cc").is_none());
        assert!(normalize_mac("zz:bb:cc:dd:ee:ff").is_none());
    }

    #[test]
    fn test_api_base() {
        assert_eq!(api_base("192.168.1.10"), "http://192.168.1.10/api");
        assert_eq!(api_base("http://srv.local/"), "http://srv.local/api");
        assert_eq!(api_base("https://srv.local/api"), "https://srv.local/api");
    }

    #[test]
    fn test_routes() {
        assert_eq!(routes::credentials("abc"), "/boot/credentials/abc");
        assert_eq!(routes::heartbeat("AA:BB"), "/heartbeat/AA:BB");
        assert_eq!(routes::diagnostic("AA:BB"), "/diagnostic/AA:BB");
        assert_eq!(routes::boot_script("AA:BB"), "/boot/AA:BB");
    }

    #[test]
    fn test_credentials_deserialize() {
        let json = r#"{"rdp_server":"rds.local","rdp_domain":"CORP","rdp_username":"alice","rdp_password":"s3cret"}"#;
        let creds: Credentials = serde_json::from_str(json).unwrap();
        assert_eq!(creds.server.as_deref(), Some("rds.local"));
        assert_eq!(creds.username.as_deref(), Some("alice"));
        assert!(!format!("{:?}", creds).contains("s3cret"));
    }

    #[test]
    fn test_credentials_override() {
        let cmdline = Credentials {
            server: Some("old.local".into()),
            domain: Some("CORP".into()),
            username: Some("bob".into()),
            password: Some("pw".into()),
        };
        let delivered = Credentials {
            server: Some("rds.local".into()),
            domain: None,
            username: Some("alice".into()),
            password: Some("s3cret".into()),
        };
        let merged = cmdline.overridden_by(&delivered);
        assert_eq!(merged.server.as_deref(), Some("rds.local"));
        assert_eq!(merged.domain.as_deref(), Some("CORP"));
        assert_eq!(merged.username.as_deref(), Some("alice"));
        assert_eq!(merged.password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_blank_delivered_fields_decode_as_absent() {
        let json = r#"{"rdp_server":"rds.local","rdp_domain":"","rdp_username":"bob","rdp_password":"  "}"#;
        let creds: Credentials = serde_json::from_str(json).unwrap();
        assert_eq!(creds.server.as_deref(), Some("rds.local"));
        assert_eq!(creds.domain, None);
        assert_eq!(creds.password, None);

        let missing: Credentials = serde_json::from_str(r#"{"rdp_server":null}"#).unwrap();
        assert_eq!(missing, Credentials::default());
    }

    #[test]
    fn test_blank_override_keeps_cmdline_value() {
        let cmdline = Credentials {
            domain: Some("CORP".into()),
            password: Some("pw".into()),
            ..Default::default()
        };
        let delivered = Credentials {
            domain: Some(String::new()),
            password: Some(" ".into()),
            ..Default::default()
        };
        let merged = cmdline.overridden_by(&delivered);
        assert_eq!(merged.domain.as_deref(), Some("CORP"));
        assert_eq!(merged.password.as_deref(), Some("pw"));

        let neither = Credentials::default().overridden_by(&delivered);
        assert_eq!(neither.domain, None);
    }
}
