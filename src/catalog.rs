/// Operation catalog: the static method tables per device, loaded from a
/// directory of TOML or YAML files.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEVICES: [&str; 2] = ["idrac", "cmc"];

/// Methods every device understands, answered by the CIM object manager
/// itself rather than a provider.
pub const META_METHODS: [&str; 3] = ["GetEPR", "GetClass", "GetInstance"];

// catalog file like:
// device = "idrac"
//
// [methods.GetRAIDControllers]
// verb = "enumerate"
// target = "cimv2/root/dcim/DCIM_ControllerView"
//
// [methods.CreateRAIDConfigJob]
// verb = "invoke"
// action = "CreateTargetedConfigJob"
// target = "cimv2/root/dcim/DCIM_RAIDService?CreationClassName=DCIM_RAIDService"
// params.Target = { example = "RAID.Integrated.1-1" }
// params.RebootJobType = { default = "", example = "3" }
#[derive(Debug, Deserialize, Serialize)]
pub struct CatalogFile {
    pub device: String,
    pub methods: BTreeMap<String, Operation>,
}

impl CatalogFile {
    /// Load a single catalog file, picking the format by extension
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog '{}'", path.display()))?;

        if let Some(ext) = path.extension() {
            if ext == "toml" {
                let file = toml::from_str(&contents)
                    .with_context(|| format!("Invalid catalog '{}'", path.display()))?;
                return Ok(file);
            } else if ext == "yaml" || ext == "yml" {
                let file = serde_yaml::from_str(&contents)
                    .with_context(|| format!("Invalid catalog '{}'", path.display()))?;
                return Ok(file);
            }
        }

        let file = if let Ok(file) = toml::from_str(&contents) {
            file
        } else {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Invalid catalog '{}'", path.display()))?
        };

        Ok(file)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Get,
    Enumerate,
    Invoke,
    Put,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Get => "get",
            Verb::Enumerate => "enumerate",
            Verb::Invoke => "invoke",
            Verb::Put => "put",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ParamValue {
    Text(String),
    Number(i64),
    List(Vec<String>),
}

impl ParamValue {
    pub fn values(&self) -> Vec<String> {
        match self {
            ParamValue::Text(s) => vec![s.clone()],
            ParamValue::Number(n) => vec![n.to_string()],
            ParamValue::List(items) => items.clone(),
        }
    }
}

/// A declared parameter. No default means the caller must supply it; an
/// empty default means it is left out when not supplied.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct ParamSpec {
    pub default: Option<ParamValue>,
    pub example: Option<ParamValue>,
}

impl ParamSpec {
    fn required(example: &str) -> Self {
        Self {
            default: None,
            example: Some(ParamValue::Text(example.to_string())),
        }
    }

    fn with_default(default: &str) -> Self {
        Self {
            default: Some(ParamValue::Text(default.to_string())),
            example: Some(ParamValue::Text(default.to_string())),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Operation {
    pub verb: Verb,
    /// Resource template, `EPR:<Class>` when it must be discovered.
    pub target: String,
    /// Remote method name when it differs from the catalog name.
    pub action: Option<String>,
    #[serde(default)]
    pub selectors: BTreeMap<String, ParamSpec>,
    #[serde(default)]
    pub params: BTreeMap<String, ParamSpec>,
}

impl Operation {
    pub fn api_name<'a>(&'a self, method: &'a str) -> &'a str {
        self.action.as_deref().unwrap_or(method)
    }

    /// Body parameters go through an XML payload file when any of them takes
    /// a list or an address reference.
    pub fn file_mode(&self) -> bool {
        self.params.values().any(|spec| {
            match spec.example.as_ref().or(spec.default.as_ref()) {
                Some(ParamValue::List(_)) => true,
                Some(ParamValue::Text(s)) => s.contains("EPR"),
                _ => false,
            }
        })
    }
}

/// Method tables keyed by device
#[derive(Debug, Clone)]
pub struct Catalog {
    devices: HashMap<String, HashMap<String, Operation>>,
}

impl Default for Catalog {
    fn default() -> Self {
        let mut catalog = Self {
            devices: HashMap::new(),
        };
        for device in DEVICES {
            for (name, op) in meta_methods() {
                catalog.insert(device, &name, op);
            }
        }
        catalog
    }
}

impl Catalog {
    /// load catalog files from path
    pub fn build<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut catalog = Self::default();
        let path = path.as_ref();
        if !path.is_dir() {
            log::warn!(
                "Catalog directory '{}' not found, only meta methods available",
                path.display()
            );
            return Ok(catalog);
        }

        let mut entries = fs::read_dir(path)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.path());

        for entry in entries {
            let file = entry.path();
            let ext = file.extension().and_then(|s| s.to_str());
            if !matches!(ext, Some("toml") | Some("yaml") | Some("yml")) {
                continue;
            }

            let loaded = CatalogFile::load(&file)?;
            log::debug!(
                "Loaded {} methods for {} from {}",
                loaded.methods.len(),
                loaded.device,
                file.display()
            );
            for (name, op) in loaded.methods {
                catalog.insert(&loaded.device, &name, op);
            }
        }

        Ok(catalog)
    }

    pub fn insert(&mut self, device: &str, name: &str, op: Operation) {
        self.devices
            .entry(device.to_string())
            .or_default()
            .insert(name.to_string(), op);
    }

    pub fn lookup(&self, device: &str, method: &str) -> Option<&Operation> {
        self.devices.get(device)?.get(method)
    }

    /// Sorted method names for a device
    pub fn methods(&self, device: &str) -> Vec<&String> {
        let mut names: Vec<&String> = self
            .devices
            .get(device)
            .map(|m| m.keys().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn meta_methods() -> Vec<(String, Operation)> {
    let namespace = || ParamSpec::with_default("root/dcim");
    let meta = |selectors: Vec<(&str, ParamSpec)>| Operation {
        verb: Verb::Enumerate,
        target: "cimv2/".to_string(),
        action: None,
        selectors: selectors
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        params: BTreeMap::new(),
    };

    vec![
        (
            "GetEPR".to_string(),
            meta(vec![
                ("Class", ParamSpec::required("CIM_PowerManagementService")),
                ("__cimnamespace", namespace()),
            ]),
        ),
        (
            "GetClass".to_string(),
            meta(vec![("Class", ParamSpec::required("DCIM_SystemView"))]),
        ),
        (
            "GetInstance".to_string(),
            meta(vec![
                ("Class", ParamSpec::required("DCIM_SystemView")),
                ("InstanceID", ParamSpec::required("System.Embedded.1")),
                ("__cimnamespace", namespace()),
            ]),
        ),
    ]
}
