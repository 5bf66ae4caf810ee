/// Variable store: settable, required and internal `$` variables plus the
/// text substitution pass applied to every script line.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::{Defaults, VERBOSE_WSMAN};
use crate::error::{ReciteError, Result};
use crate::hosts;
use crate::utils::{mask_secret, MASK};

// Internal variables, maintained by the interpreter
pub const VAR_BATCHFILE: &str = "$_BATCHFILE";
pub const VAR_DATE: &str = "$_DATE";
pub const VAR_LOCALIP: &str = "$_LOCALIP";
pub const VAR_LINE: &str = "$_LINE";

// Private variables, reserved for extraction scratch
pub const PRIVATE: [&str; 4] = ["$_UNTIL", "$_FIND", "$_PARENT", "$_COUNT"];

// Settable variables
pub const FORMAT: &str = "$FORMAT";
pub const IP: &str = "$IP";
pub const LOGIN: &str = "$LOGIN";
pub const PASS: &str = "$PASS";
pub const DEVICE: &str = "$DEVICE";
pub const PORT: &str = "$PORT";
pub const PROGRAM: &str = "$PROGRAM";
pub const TIMER: &str = "$TIMER";
pub const USLEEP: &str = "$USLEEP";
pub const UTIMEOUT: &str = "$UTIMEOUT";
pub const VERBOSE: &str = "$VERBOSE";

pub const REQUIRED: [&str; 11] = [
    FORMAT, IP, LOGIN, PASS, PORT, DEVICE, PROGRAM, TIMER, USLEEP, UTIMEOUT, VERBOSE,
];

const NUMERIC: [&str; 4] = [VERBOSE, PORT, USLEEP, UTIMEOUT];
const DEVICES: [&str; 2] = ["idrac", "cmc"];
const FORMATS: [&str; 3] = ["normal", "xml", "prettyxml"];
const ESCAPED_DOLLAR: &str = "\u{0}DOLLAR\u{0}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// `$_LINE`, `$_DATE`, ... maintained or computed by the interpreter.
    Internal,
    /// Reserved extraction scratch names.
    Private,
    Settable,
    /// Settable, but can never be unset.
    Required,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Int(i64),
    List(Vec<String>),
}

impl Value {
    pub fn as_list(&self) -> Vec<String> {
        match self {
            Value::List(items) => items.clone(),
            other => vec![other.to_string()],
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{}", s),
            Value::Int(n) => write!(f, "{}", n),
            Value::List(items) => write!(f, "{}", items.join(",")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

#[derive(Debug)]
pub struct VarStore {
    values: BTreeMap<String, Value>,
    defaults: Defaults,
}

impl VarStore {
    pub fn new(defaults: &Defaults) -> Self {
        let mut values = BTreeMap::new();
        values.insert(FORMAT.to_string(), Value::from(defaults.format.as_str()));
        values.insert(IP.to_string(), Value::from(""));
        values.insert(LOGIN.to_string(), Value::from(defaults.login.as_str()));
        values.insert(PASS.to_string(), Value::from(defaults.password.as_str()));
        values.insert(PORT.to_string(), Value::Int(defaults.port as i64));
        values.insert(DEVICE.to_string(), Value::from(defaults.device.as_str()));
        values.insert(PROGRAM.to_string(), Value::from("False"));
        values.insert(TIMER.to_string(), Value::from(bool_text(defaults.timer)));
        values.insert(USLEEP.to_string(), Value::Int(defaults.usleep as i64));
        values.insert(UTIMEOUT.to_string(), Value::Int(defaults.utimeout as i64));
        values.insert(VERBOSE.to_string(), Value::Int(defaults.verbose));

        Self {
            values,
            defaults: defaults.clone(),
        }
    }

    pub fn category(name: &str) -> Category {
        if PRIVATE.contains(&name) {
            Category::Private
        } else if name.starts_with("$_") {
            Category::Internal
        } else if REQUIRED.contains(&name) {
            Category::Required
        } else {
            Category::Settable
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if name == VAR_DATE {
            return Some(Value::Text(timestamp()));
        }
        self.values.get(name).cloned()
    }

    pub fn get_str(&self, name: &str) -> Option<String> {
        self.get(name).map(|v| v.to_string())
    }

    pub fn contains(&self, name: &str) -> bool {
        name == VAR_DATE || self.values.contains_key(name)
    }

    /// Integer value of a numeric variable; text holding digits also counts.
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name)? {
            Value::Int(n) => Some(*n),
            Value::Text(s) => s.trim().parse().ok(),
            Value::List(_) => None,
        }
    }

    pub fn verbose(&self) -> i64 {
        self.int(VERBOSE).unwrap_or(self.defaults.verbose)
    }

    pub fn password(&self) -> String {
        self.get_str(PASS).unwrap_or_default()
    }

    pub fn device(&self) -> String {
        self.get_str(DEVICE)
            .unwrap_or_else(|| self.defaults.device.clone())
    }

    pub fn flag(&self, name: &str) -> bool {
        self.get_str(name).as_deref() == Some("True")
    }

    /// `Set $name value` as typed by a user or a script. `value` has already
    /// been through [`VarStore::expand`].
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        check_name(name)?;
        match Self::category(name) {
            Category::Internal | Category::Private => {
                return Err(ReciteError::ReadOnly(name.to_string()))
            }
            Category::Settable | Category::Required => {}
        }

        match name {
            IP => self.set_ip(value),
            DEVICE => {
                if DEVICES.contains(&value) {
                    self.store(name, Value::from(value));
                } else {
                    log::warn!("Permissible values are 'idrac' or 'cmc'. Setting $DEVICE to idrac");
                    self.store(name, Value::from("idrac"));
                }
            }
            FORMAT => {
                if FORMATS.contains(&value) {
                    self.store(name, Value::from(value));
                } else {
                    log::warn!("Unknown value for $FORMAT. Supported = normal, xml, prettyxml");
                    self.store(name, Value::from("normal"));
                }
            }
            PROGRAM => match value {
                "True" => {
                    self.store(PROGRAM, Value::from("True"));
                    self.store(VERBOSE, Value::Int(VERBOSE_WSMAN));
                    self.store(FORMAT, Value::from("xml"));
                }
                "False" => self.store(PROGRAM, Value::from("False")),
                _ => {
                    log::warn!("Boolean value expected for $PROGRAM");
                    self.store(PROGRAM, Value::from("False"));
                }
            },
            _ if NUMERIC.contains(&name) => match value.trim().parse::<i64>() {
                Ok(n) => self.store(name, Value::Int(n)),
                Err(_) => {
                    let fallback = self.numeric_default(name);
                    log::warn!(
                        "Numeric value expected for {}, reverting to {}",
                        name,
                        fallback
                    );
                    self.store(name, Value::Int(fallback));
                }
            },
            _ => self.store(name, Value::from(value)),
        }

        Ok(())
    }

    /// Bind an extraction result. Only settable names are accepted.
    pub fn bind(&mut self, name: &str, value: Value) -> Result<()> {
        check_name(name)?;
        match Self::category(name) {
            Category::Internal | Category::Private => Err(ReciteError::ReadOnly(name.to_string())),
            _ => {
                self.store(name, value);
                Ok(())
            }
        }
    }

    /// Drop a binding before an extraction writes it again. Required and
    /// internal variables are left untouched.
    pub fn clear(&mut self, name: &str) {
        if Self::category(name) == Category::Settable {
            self.values.remove(name);
        }
    }

    pub fn unset(&mut self, name: &str) -> Result<bool> {
        match Self::category(name) {
            Category::Required => Err(ReciteError::ProtectedVariable(name.to_string())),
            Category::Internal | Category::Private => Err(ReciteError::ReadOnly(name.to_string())),
            Category::Settable => Ok(self.values.remove(name).is_some()),
        }
    }

    pub(crate) fn set_internal(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    pub(crate) fn remove_internal(&mut self, name: &str) {
        self.values.remove(name);
    }

    /// Substitute every defined variable in `text`.
    ///
    /// Longer names are replaced first so `$t` never corrupts `$tango`. The
    /// password is always rendered masked. Unknown `$word` tokens vanish and
    /// `\$` yields a literal dollar.
    pub fn expand(&self, text: &str) -> String {
        self.substitute(text, true)
    }

    /// Like [`VarStore::expand`] but with the real password, for arguments
    /// handed to the request builder. Never echo the result.
    pub fn expand_secret(&self, text: &str) -> String {
        self.substitute(text, false)
    }

    fn substitute(&self, text: &str, masked: bool) -> String {
        let mut out = text.replace("\\$", ESCAPED_DOLLAR);

        let mut names: Vec<&String> = self.values.keys().collect();
        names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| b.cmp(a)));
        for name in names {
            if !out.contains(name.as_str()) {
                continue;
            }
            let data = if masked && name == PASS {
                MASK.to_string()
            } else {
                self.values[name].to_string()
            };
            out = out.replace(name.as_str(), &data);
        }

        if out.contains(VAR_DATE) {
            out = out.replace(VAR_DATE, &timestamp());
        }
        out = leftover_var_regex().replace_all(&out, "").into_owned();

        out.replace(ESCAPED_DOLLAR, "$")
    }

    /// Mask the active password anywhere in `text`.
    pub fn mask(&self, text: &str) -> String {
        mask_secret(text, &self.password())
    }

    /// `name: value` lines for every variable, sorted by name.
    pub fn listing(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|(name, value)| {
                if name == PASS {
                    format!("{}: {}", name, MASK)
                } else {
                    format!("{}: {}", name, value)
                }
            })
            .collect()
    }

    fn store(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    fn numeric_default(&self, name: &str) -> i64 {
        match name {
            VERBOSE => self.defaults.verbose,
            PORT => self.defaults.port as i64,
            USLEEP => self.defaults.usleep as i64,
            _ => self.defaults.utimeout as i64,
        }
    }

    fn set_ip(&mut self, value: &str) {
        let Some(spec) = hosts::parse_host_string(value) else {
            log::warn!("Skipping malformed IP string in {}", hosts::mask_credentials(value));
            return;
        };

        let login = spec
            .user
            .clone()
            .unwrap_or_else(|| self.defaults.login.clone());
        self.store(LOGIN, Value::Text(login));

        if let Some(password) = spec.password {
            self.store(PASS, Value::Text(password));
        } else if let Some(user) = &spec.user {
            match rpassword::prompt_password(format!("Password for {}@{}: ", user, spec.host)) {
                Ok(password) => self.store(PASS, Value::Text(password)),
                Err(e) => log::warn!("Failed to read password: {}", e),
            }
        }

        self.store(IP, Value::Text(spec.host));
    }
}

fn check_name(name: &str) -> Result<()> {
    let valid = name.len() > 1
        && name.starts_with('$')
        && name[1..].chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ReciteError::Script(format!(
            "Invalid variable name '{}', expected $Name",
            name
        )))
    }
}

fn bool_text(b: bool) -> &'static str {
    if b {
        "True"
    } else {
        "False"
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}

fn leftover_var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\w+").unwrap())
}
