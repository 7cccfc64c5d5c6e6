//! Pure parsing functions for external tool output.
//!
//! Everything here is OS-independent and side-effect free so it can be unit
//! tested anywhere; the command execution happens in the stage modules.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ReleaseMetadata {
    tag_name: Option<String>,
}

/// Extract the release version from a GitHub "latest release" JSON body.
///
/// The leading `v` is stripped (`v2.11.3` -> `2.11.3`). Returns `None` for a
/// missing, empty, or unparseable tag; the caller treats that as fatal before
/// anything is downloaded.
pub fn parse_release_tag(body: &str) -> Option<String> {
    let meta: ReleaseMetadata = serde_json::from_str(body).ok()?;
    let tag = meta.tag_name?;
    let version = tag.trim().trim_start_matches('v').to_string();
    if version.is_empty() {
        return None;
    }
    Some(version)
}

/// One listening TCP socket from `ss -tlnp` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub port: u16,
    /// Process name from the `users:(("name",pid=..))` column, when present
    /// (requires root).
    pub process: Option<String>,
}

/// Parse `ss -tlnp` output into listening sockets.
///
/// Unparseable lines are skipped; `ss` header included.
pub fn parse_ss_listeners(output: &str) -> Vec<Listener> {
    let mut out = Vec::new();
    for line in output.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 4 || cols[0] != "LISTEN" {
            continue;
        }
        // Local address is "addr:port"; addr may itself contain ':' ([::]).
        let local = cols[3];
        let Some(idx) = local.rfind(':') else { continue };
        let Ok(port) = local[idx + 1..].parse::<u16>() else {
            continue;
        };

        let process = line
            .find("users:((\"")
            .map(|i| &line[i + "users:((\"".len()..])
            .and_then(|rest| rest.split('"').next())
            .map(|s| s.to_string());

        out.push(Listener { port, process });
    }
    out
}

/// Find the process listening on `port`, if any.
pub fn listener_on_port(listeners: &[Listener], port: u16) -> Option<&Listener> {
    listeners.iter().find(|l| l.port == port)
}

/// Parse nameserver addresses out of resolv.conf content, in file order.
///
/// Used to synthesize the `resolver` directive for the web-server config.
pub fn parse_resolv_conf_nameservers(contents: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("nameserver") {
            let addr = rest.trim();
            if !addr.is_empty() {
                out.push(addr.to_string());
            }
        }
    }
    out
}

/// Scan journal output for lines containing the case-sensitive substring
/// `error`, returning the last `keep` matches in order.
///
/// This deliberately does not distinguish genuine errors from incidental text;
/// matches are only ever reported as warnings.
pub fn scan_journal_for_errors<'a>(output: &'a str, keep: usize) -> Vec<&'a str> {
    let matches: Vec<&str> = output.lines().filter(|l| l.contains("error")).collect();
    let skip = matches.len().saturating_sub(keep);
    matches[skip..].to_vec()
}

/// Look up a single field in /etc/os-release content (`ID=ubuntu` ->
/// `ubuntu`). Surrounding quotes are stripped; empty values count as absent.
pub fn parse_os_release_field(contents: &str, field: &str) -> Option<String> {
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == field {
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Pull the distribution codename out of /etc/os-release content
/// (`VERSION_CODENAME=jammy` -> `jammy`), used to build the vendor apt
/// source line.
pub fn parse_os_release_codename(contents: &str) -> Option<String> {
    parse_os_release_field(contents, "VERSION_CODENAME")
}

/// Parse the major version from `node --version` output (`v18.19.0` -> 18).
pub fn parse_node_major(output: &str) -> Option<u32> {
    output
        .trim()
        .trim_start_matches('v')
        .split('.')
        .next()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_release_tag_strips_v_prefix() {
        let body = r#"{"tag_name": "v2.11.3", "name": "v2.11.3"}"#;
        assert_eq!(parse_release_tag(body), Some("2.11.3".to_string()));
    }

    #[test]
    fn parse_release_tag_without_prefix() {
        let body = r#"{"tag_name": "2.10.0"}"#;
        assert_eq!(parse_release_tag(body), Some("2.10.0".to_string()));
    }

    #[test]
    fn parse_release_tag_empty_is_none() {
        assert_eq!(parse_release_tag(r#"{"tag_name": ""}"#), None);
        assert_eq!(parse_release_tag(r#"{"tag_name": "v"}"#), None);
        assert_eq!(parse_release_tag(r#"{"name": "no tag"}"#), None);
        assert_eq!(parse_release_tag("not json"), None);
    }

    #[test]
    fn parse_ss_listeners_basic() {
        let output = "\
State   Recv-Q  Send-Q   Local Address:Port   Peer Address:Port  Process
LISTEN  0       511            0.0.0.0:80          0.0.0.0:*      users:((\"nginx\",pid=123,fd=6))
LISTEN  0       128               [::]:22             [::]:*      users:((\"sshd\",pid=800,fd=4))
LISTEN  0       511          127.0.0.1:81          0.0.0.0:*
";
        let listeners = parse_ss_listeners(output);
        assert_eq!(listeners.len(), 3);
        assert_eq!(
            listeners[0],
            Listener {
                port: 80,
                process: Some("nginx".to_string())
            }
        );
        assert_eq!(listeners[1].port, 22);
        assert_eq!(listeners[1].process.as_deref(), Some("sshd"));
        // No process column without root.
        assert_eq!(
            listeners[2],
            Listener {
                port: 81,
                process: None
            }
        );
    }

    #[test]
    fn parse_ss_listeners_skips_garbage() {
        assert!(parse_ss_listeners("").is_empty());
        assert!(parse_ss_listeners("ESTAB 0 0 1.2.3.4:5 6.7.8.9:10").is_empty());
        assert!(parse_ss_listeners("LISTEN 0 128 no-port-here *").is_empty());
    }

    #[test]
    fn listener_on_port_finds_match() {
        let listeners = vec![
            Listener {
                port: 80,
                process: Some("nginx".to_string()),
            },
            Listener {
                port: 81,
                process: None,
            },
        ];
        assert!(listener_on_port(&listeners, 81).is_some());
        assert!(listener_on_port(&listeners, 443).is_none());
    }

    #[test]
    fn parse_resolv_conf_nameservers_basic() {
        let contents = "\
# Generated by NetworkManager
search localdomain
nameserver 192.168.1.1
nameserver 8.8.8.8
; comment
nameserver\n";
        assert_eq!(
            parse_resolv_conf_nameservers(contents),
            vec!["192.168.1.1".to_string(), "8.8.8.8".to_string()]
        );
    }

    #[test]
    fn scan_journal_for_errors_is_case_sensitive_and_keeps_tail() {
        let output = "\
line one error a
line two ERROR b
line three fine
line four error c
line five error d
";
        let found = scan_journal_for_errors(output, 2);
        assert_eq!(found, vec!["line four error c", "line five error d"]);
        // "ERROR" (uppercase) must not match.
        assert_eq!(scan_journal_for_errors("only ERROR here", 10).len(), 0);
    }

    #[test]
    fn parse_os_release_codename_variants() {
        let ubuntu = "NAME=\"Ubuntu\"\nVERSION_CODENAME=jammy\nID=ubuntu\n";
        assert_eq!(
            parse_os_release_codename(ubuntu),
            Some("jammy".to_string())
        );
        let quoted = "VERSION_CODENAME=\"bookworm\"\n";
        assert_eq!(
            parse_os_release_codename(quoted),
            Some("bookworm".to_string())
        );
        assert_eq!(parse_os_release_codename("ID=alpine\n"), None);
    }

    #[test]
    fn parse_os_release_field_variants() {
        let debian = "PRETTY_NAME=\"Debian GNU/Linux 12\"\nID=debian\nVERSION_CODENAME=bookworm\n";
        assert_eq!(
            parse_os_release_field(debian, "ID"),
            Some("debian".to_string())
        );
        let mint = "ID=linuxmint\nID_LIKE=\"ubuntu debian\"\n";
        assert_eq!(
            parse_os_release_field(mint, "ID_LIKE"),
            Some("ubuntu debian".to_string())
        );
        assert_eq!(parse_os_release_field(debian, "ID_LIKE"), None);
        assert_eq!(parse_os_release_field("ID=\n", "ID"), None);
    }

    #[test]
    fn parse_node_major_variants() {
        assert_eq!(parse_node_major("v18.19.0\n"), Some(18));
        assert_eq!(parse_node_major("20.1.0"), Some(20));
        assert_eq!(parse_node_major(""), None);
        assert_eq!(parse_node_major("nonsense"), None);
    }
}
