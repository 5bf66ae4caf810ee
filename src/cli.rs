/// CLI interface and argument classification.

/// Executor for parallel host sessions.
pub mod executor;

/// Single-host session and the interactive prompt.
pub mod run;

use std::path::Path;

use clap::Parser;

use crate::hosts;

#[derive(Parser, Debug)]
#[command(name = "recite")]
#[command(
    about = "📜 WS-Management scripting shell - run methods, scripts and interactive sessions against management controllers"
)]
pub struct Cli {
    /// Config file
    #[arg(short, long, default_value = "recite.toml")]
    pub config: String,

    /// Catalog directory (overrides the config file)
    #[arg(long)]
    pub catalog: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Hosts to run at the same time when IP= lists several
    #[arg(short, long, default_value = "10")]
    pub parallel: usize,

    /// Quit after the inline commands instead of prompting
    #[arg(short, long)]
    pub quit: bool,

    /// Write each host's output to <host>.log
    #[arg(short, long)]
    pub silent: bool,

    /// Maximum retry attempts for a failed host session
    #[arg(long, default_value = "0")]
    pub max_retry: u32,

    /// NAME=VALUE presets, script files and inline commands
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub items: Vec<String>,
}

/// What the command line asks for, in execution order: presets, inline
/// commands, then scripts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Set when `IP=` expands to more than one host.
    pub hosts: Vec<String>,
    /// `NAME=VALUE` pairs, applied as `Set $NAME VALUE`; `IP` comes first.
    pub presets: Vec<(String, String)>,
    pub commands: Vec<String>,
    pub scripts: Vec<String>,
    /// Skip the interactive prompt once commands are done.
    pub quit: bool,
}

impl Plan {
    /// Classify command line items. `env_ip` is used when no `IP=` item is
    /// given.
    pub fn parse(items: &[String], env_ip: Option<&str>, quit: bool) -> Self {
        let mut plan = Plan {
            quit,
            ..Default::default()
        };

        let has_ip = items.iter().any(|i| i.starts_with("IP="));
        let env_item = env_ip.filter(|_| !has_ip).map(|ip| format!("IP={}", ip));

        for item in items.iter().chain(env_item.iter()) {
            if let Some((name, value)) = preset(item) {
                if name == "IP" {
                    plan.add_hosts(value);
                } else {
                    plan.presets.push((name.to_string(), value.to_string()));
                }
            } else if Path::new(item).is_file() {
                plan.scripts.push(item.clone());
            } else {
                plan.commands.push(item.clone());
            }
        }

        plan
    }

    fn add_hosts(&mut self, value: &str) {
        let entries: Vec<&str> = value.split(',').collect();
        let mut expanded = hosts::expand_hosts(&entries);
        match expanded.len() {
            0 => log::warn!("No usable host in IP={}", hosts::mask_credentials(value)),
            1 => {
                if let Some(host) = expanded.pop() {
                    self.presets.insert(0, ("IP".to_string(), host));
                }
            }
            _ => self.hosts = expanded,
        }
    }

    /// Whether the prompt opens after the commands.
    pub fn interactive(&self) -> bool {
        !self.quit && self.scripts.is_empty()
    }

    /// Items for a child session bound to `host`.
    pub fn child_items(&self, host: &str) -> Vec<String> {
        std::iter::once(format!("IP={}", host))
            .chain(self.presets.iter().map(|(n, v)| format!("{}={}", n, v)))
            .chain(self.commands.iter().cloned())
            .chain(self.scripts.iter().cloned())
            .collect()
    }
}

/// `NAME=VALUE` where NAME is a plain word. Anything else, such as
/// `$x=1` or `GetJob InstanceID=1`, is a command.
fn preset(item: &str) -> Option<(&str, &str)> {
    let (name, value) = item.split_once('=')?;
    let word = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    (word && !value.is_empty()).then_some((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn items(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn items_are_classified() {
        let mut script = tempfile::Builder::new().suffix(".win").tempfile().unwrap();
        writeln!(script, "Print hi").unwrap();
        let path = script.path().to_string_lossy().into_owned();

        let plan = Plan::parse(
            &items(&["VERBOSE=0", &path, "GetJob InstanceID=JID_1", "$x=1", "IP=root:pw@10.0.0.7"]),
            None,
            false,
        );

        assert_eq!(
            plan.presets,
            vec![("IP".to_string(), "root:pw@10.0.0.7".to_string()), ("VERBOSE".to_string(), "0".to_string())]
        );
        assert_eq!(plan.scripts, vec![path]);
        assert_eq!(plan.commands, items(&["GetJob InstanceID=JID_1", "$x=1"]));
        assert!(plan.hosts.is_empty());
        assert!(!plan.interactive());
    }

    #[test]
    fn several_hosts_fan_out() {
        let plan = Plan::parse(&items(&["IP=10.0.0.1-10.0.0.3,10.0.0.9", "Print x"]), None, true);

        assert_eq!(plan.hosts, items(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.9"]));
        assert!(plan.presets.is_empty());
        assert_eq!(plan.child_items("10.0.0.2"), items(&["IP=10.0.0.2", "Print x"]));
    }

    #[test]
    fn environment_ip_is_a_fallback() {
        let plan = Plan::parse(&items(&["Print x"]), Some("10.0.0.5"), false);
        assert_eq!(plan.presets, vec![("IP".to_string(), "10.0.0.5".to_string())]);
        assert!(plan.interactive());

        let plan = Plan::parse(&items(&["IP=10.0.0.6"]), Some("10.0.0.5"), false);
        assert_eq!(plan.presets, vec![("IP".to_string(), "10.0.0.6".to_string())]);
    }

    #[test]
    fn cli_accepts_hyphenated_items() {
        let cli = Cli::parse_from(["recite", "-q", "-p", "4", "IP=10.0.0.1", "-Find FQDD"]);
        assert!(cli.quit);
        assert_eq!(cli.parallel, 4);
        assert_eq!(cli.items, items(&["IP=10.0.0.1", "-Find FQDD"]));
    }
}
