/// Host strings: `[user[:pass]@]host`, IPv4 ranges and host list files.
use std::fmt;
use std::fs;
use std::net::{Ipv4Addr, UdpSocket};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::utils::MASK;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
}

impl HostSpec {
    fn prefix(&self) -> String {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => format!("{}:{}@", user, password),
            (Some(user), None) => format!("{}@", user),
            _ => String::new(),
        }
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.user, &self.password) {
            (Some(user), Some(_)) => write!(f, "{}:{}@{}", user, MASK, self.host),
            (Some(user), None) => write!(f, "{}@{}", user, self.host),
            _ => write!(f, "{}", self.host),
        }
    }
}

/// Split `user:pass@host`, `user@host` or `host`. The host must look like an
/// IPv4 address or a DNS name.
pub fn parse_host_string(text: &str) -> Option<HostSpec> {
    let text = text.trim();
    let (user, password, host) = match text.rsplit_once('@') {
        Some((creds, host)) => match creds.split_once(':') {
            Some((user, password)) if !user.is_empty() && !password.is_empty() => {
                (Some(user), Some(password), host)
            }
            Some(_) => return None,
            None if !creds.is_empty() => (Some(creds), None, host),
            None => return None,
        },
        None => (None, None, text),
    };

    if !is_ipv4(host) && !is_hostname(host) {
        return None;
    }

    Some(HostSpec {
        user: user.map(str::to_string),
        password: password.map(str::to_string),
        host: host.to_string(),
    })
}

pub fn is_ipv4(text: &str) -> bool {
    text.parse::<Ipv4Addr>().is_ok()
}

/// Syntax check only; names are not looked up.
pub fn is_hostname(text: &str) -> bool {
    let name = text.strip_suffix('.').unwrap_or(text);
    if name.is_empty() || text.len() > 255 {
        return false;
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// `[creds@]a.b.c.d-a.b.c.e` into one entry per address, credentials kept.
pub fn expand_range(text: &str) -> Option<Vec<String>> {
    let (first, last) = text.split_once('-')?;
    let start = parse_host_string(first)?;
    let from: u32 = start.host.parse::<Ipv4Addr>().ok()?.into();
    let to: u32 = last.trim().parse::<Ipv4Addr>().ok()?.into();
    if from > to {
        return None;
    }

    let prefix = start.prefix();
    Some(
        (from..=to)
            .map(|n| format!("{}{}", prefix, Ipv4Addr::from(n)))
            .collect(),
    )
}

/// Expand host entries: files are read line by line (`#` starts a comment),
/// ranges are enumerated, duplicates and malformed entries are dropped.
pub fn expand_hosts<S: AsRef<str>>(entries: &[S]) -> Vec<String> {
    let mut hosts = Vec::new();
    expand_into(entries, None, &mut hosts);
    hosts
}

fn expand_into<S: AsRef<str>>(entries: &[S], source: Option<&Path>, hosts: &mut Vec<String>) {
    let origin = source
        .map(|p| format!(" in file {}", p.display()))
        .unwrap_or_default();

    for entry in entries {
        let entry = entry.as_ref().trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }

        let path = Path::new(entry);
        if path.is_file() {
            match fs::read_to_string(path) {
                Ok(contents) => {
                    let lines: Vec<&str> = contents.lines().collect();
                    expand_into(&lines, Some(path), hosts);
                }
                Err(e) => log::warn!("Failed to read host file {}: {}", entry, e),
            }
            continue;
        }

        let found = if entry.contains('-') {
            expand_range(entry).or_else(|| parse_host_string(entry).map(|_| vec![entry.to_string()]))
        } else {
            parse_host_string(entry).map(|_| vec![entry.to_string()])
        };

        match found {
            Some(found) => {
                for host in found {
                    if !hosts.contains(&host) {
                        hosts.push(host);
                    }
                }
            }
            None => log::warn!("Skipping malformed IP string {}{}", mask_credentials(entry), origin),
        }
    }
}

/// Replace the password of every `user:pass@` prefix in `text` with [`MASK`].
pub fn mask_credentials(text: &str) -> String {
    credentials_regex()
        .replace_all(text, format!("${{1}}:{}@", MASK).as_str())
        .into_owned()
}

fn credentials_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([^\s,:@]+):[^\s,]*@").unwrap())
}

/// Address of the interface that would route to the outside world. No
/// packet is sent.
pub fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn host_string_forms() {
        assert_eq!(
            parse_host_string("root:calvin@10.0.0.1"),
            Some(HostSpec {
                user: Some("root".into()),
                password: Some("calvin".into()),
                host: "10.0.0.1".into()
            })
        );
        assert_eq!(
            parse_host_string("admin@idrac-01.lab.local").unwrap().user.as_deref(),
            Some("admin")
        );
        assert_eq!(parse_host_string("10.0.0.1").unwrap().host, "10.0.0.1");
        assert!(parse_host_string("bad host!").is_none());
        assert!(parse_host_string("@10.0.0.1").is_none());
    }

    #[test]
    fn credentials_are_masked_in_free_text() {
        assert_eq!(mask_credentials("root:calvin@bad host!"), "root:******@bad host!");
        assert_eq!(
            mask_credentials("Set $IP root:p@ss:w0rd@10.0.0.1"),
            "Set $IP root:******@10.0.0.1"
        );
        assert_eq!(
            mask_credentials("a:one@10.0.0.1,b:two@10.0.0.2"),
            "a:******@10.0.0.1,b:******@10.0.0.2"
        );
        assert_eq!(mask_credentials("admin@10.0.0.1"), "admin@10.0.0.1");
        assert_eq!(mask_credentials("Print $a:b"), "Print $a:b");
    }

    #[test]
    fn display_hides_password() {
        let spec = parse_host_string("root:calvin@10.0.0.1").unwrap();
        assert_eq!(spec.to_string(), "root:******@10.0.0.1");
    }

    #[test]
    fn ranges_keep_credentials() {
        assert_eq!(
            expand_range("root:pw@10.0.0.254-10.0.1.1").unwrap(),
            vec!["root:pw@10.0.0.254", "root:pw@10.0.0.255", "root:pw@10.0.1.0", "root:pw@10.0.1.1"]
        );
        assert!(expand_range("10.0.0.5-10.0.0.1").is_none());
    }

    #[test]
    fn host_files_are_expanded_and_deduplicated() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# lab rack 3").unwrap();
        writeln!(file, "10.0.0.1").unwrap();
        writeln!(file, "10.0.0.1-10.0.0.3").unwrap();
        writeln!(file, "not a host").unwrap();
        file.flush().unwrap();

        let path = file.path().to_string_lossy().into_owned();
        let hosts = expand_hosts(&[path.as_str(), "10.0.0.3", "server-a"]);
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "server-a"]);
    }
}
