/// Request builder: turns `Method name=value ...` into a `wsman` invocation,
/// resolving defaults, file references and discovered endpoint addresses.
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

use tempfile::{NamedTempFile, TempPath};

use crate::catalog::{Catalog, ParamSpec, Verb, META_METHODS};
use crate::config::TransportConfig;
use crate::epr::{Endpoints, EprSelect};
use crate::error::{ReciteError, Result};
use crate::transport::Invocation;
use crate::utils::mask_secret;
use crate::vars::{VarStore, IP, LOGIN, PORT};

pub const CIM_SCHEMA: &str = "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/";

const DIALECT_WQL: &str = "http://schemas.microsoft.com/wbem/wsman/1/WQL";
const DIALECT_ASSOC: &str = "http://schemas.dmtf.org/wbem/wsman/1/cimbinding/associationFilter";
const DIALECT_CQL: &str = "http://schemas.dmtf.org/wbem/cql/1/dsp0202.pdf";

/// A method name with its `name=value` arguments. Repeated names accumulate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Call {
    pub method: String,
    pub params: BTreeMap<String, Vec<String>>,
}

impl Call {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.params
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
        self
    }

    /// First token is the method; tokens not in `name=value` form are
    /// skipped with a warning in which `secret` is masked.
    pub fn from_tokens(tokens: &[String], secret: &str) -> Result<Self> {
        let (method, rest) = tokens
            .split_first()
            .ok_or_else(|| ReciteError::Script("Missing method name".to_string()))?;

        let mut call = Call::new(method.as_str());
        for token in rest {
            match token.split_once('=') {
                Some((name, value)) => call = call.with(name, value),
                None => log::warn!(
                    "Skipping '{}' not in name=value format",
                    mask_secret(token, secret)
                ),
            }
        }
        Ok(call)
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .and_then(|v| v.first())
            .map(String::as_str)
    }
}

/// Everything a built call needs to run.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub invocation: Invocation,
    /// Payload text, shown when echoing the call.
    pub payload: Option<String>,
    /// Keeps the payload file alive while the request may still run.
    pub payload_file: Option<TempPath>,
}

/// Read-only inputs of the builder.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub catalog: &'a Catalog,
    pub vars: &'a VarStore,
    pub transport: &'a TransportConfig,
}

impl<'a> BuildContext<'a> {
    pub fn build(&self, call: &Call, endpoints: &mut dyn Endpoints) -> Result<Request> {
        let device = self.vars.device();
        let op = self
            .catalog
            .lookup(&device, &call.method)
            .ok_or_else(|| ReciteError::UnknownMethod(call.method.clone()))?;
        let api = op.api_name(&call.method);
        let select = call
            .first("-eprselect")
            .map(EprSelect::parse)
            .unwrap_or_default();
        let file_mode = op.file_mode();

        // Every declared parameter is checked before anything is resolved
        // remotely.
        let selectors = resolve_params(&call.method, &op.selectors, call)?;
        let body = resolve_params(&call.method, &op.params, call)?;

        let ip = self
            .vars
            .get_str(IP)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| ReciteError::Script("$IP undefined. --> Set $IP host".to_string()))?;

        let target = if op.target.contains("EPR") {
            endpoints.resolve_url(&call.method, &op.target, &select)?
        } else {
            op.target.clone()
        };
        let resource = resource_uri(&target);
        let namespace = resource.split('?').next().unwrap_or_default().to_string();
        let resource = with_selectors(&resource, &call.method, &selectors);

        let mut args = vec![op.verb.to_string()];
        if op.verb == Verb::Invoke {
            args.push("-a".to_string());
            args.push(api.to_string());
        }
        args.push(resource);

        let mut payload = None;
        if file_mode {
            let mut xml = format!("<p:{}_INPUT xmlns:p=\"{}\">\r\n", api, namespace);
            for (name, values) in &body {
                for value in values {
                    if value.contains("EPR:") {
                        xml.push_str(&endpoints.resolve_address(&call.method, value, name, &select)?);
                    } else {
                        xml.push_str(&format!("  <p:{}>{}</p:{}>\r\n", name, value, name));
                    }
                }
            }
            xml.push_str(&format!("</p:{}_INPUT>\r\n", api));
            payload = Some(xml);
        } else {
            for (name, values) in &body {
                for value in values {
                    args.push("-k".to_string());
                    args.push(format!("{}={}", name, value));
                }
            }
        }

        let password = self.vars.password();
        args.extend([
            "-h".to_string(),
            ip,
            "-P".to_string(),
            self.vars.get_str(PORT).unwrap_or_default(),
            "-u".to_string(),
            self.vars.get_str(LOGIN).unwrap_or_default(),
            "-p".to_string(),
            password.clone(),
        ]);
        args.extend(self.transport.flags.iter().cloned());

        for (flag, dialect) in [("-wql", DIALECT_WQL), ("-assoc", DIALECT_ASSOC), ("-cql", DIALECT_CQL)] {
            if let Some(filter) = call.first(flag) {
                args.push(format!("--dialect={}", dialect));
                args.push(format!("--filter={}", filter));
                break;
            }
        }

        if call.method == "GetEPR" {
            args.push("-M".to_string());
            args.push("epr".to_string());
        }

        let mut invocation = Invocation::new(self.transport.program.clone(), args, password);
        let mut payload_file = None;
        if let Some(xml) = &payload {
            let path = write_payload(xml)?;
            invocation.args.push("-J".to_string());
            invocation.args.push(path.to_string_lossy().into_owned());
            invocation = invocation.with_payload(path.to_path_buf());
            payload_file = Some(path);
        }

        Ok(Request {
            method: call.method.clone(),
            invocation,
            payload,
            payload_file,
        })
    }
}

/// Resolved `name -> values`, name-sorted, with omitted parameters dropped.
fn resolve_params(
    method: &str,
    declared: &BTreeMap<String, ParamSpec>,
    call: &Call,
) -> Result<Vec<(String, Vec<String>)>> {
    let mut resolved = Vec::new();
    for (name, spec) in declared {
        let values = match (call.params.get(name), &spec.default) {
            (Some(given), _) => given.clone(),
            (None, None) => {
                return Err(ReciteError::MissingRequiredParameter {
                    method: method.to_string(),
                    param: name.clone(),
                })
            }
            (None, Some(default)) => {
                let values = default.values();
                if values.iter().all(|v| v.is_empty()) {
                    continue;
                }
                values
            }
        };

        let values = values
            .into_iter()
            .map(|value| match value.strip_prefix("file:") {
                Some(file) => fs::read_to_string(file).map_err(|_| ReciteError::FileReference {
                    file: file.to_string(),
                    param: name.clone(),
                }),
                None => Ok(value),
            })
            .collect::<Result<Vec<_>>>()?;
        resolved.push((name.clone(), values));
    }
    Ok(resolved)
}

/// Absolute resource URI for a target template. Short templates drop their
/// four-character schema tag (`cimv2/...`) in favour of the CIM schema root.
pub fn resource_uri(template: &str) -> String {
    let uri = if template.starts_with("http") {
        template.to_string()
    } else {
        format!("{}{}", CIM_SCHEMA, template.get(4..).unwrap_or_default())
    };
    uri.replace('+', ",")
}

fn with_selectors(resource: &str, method: &str, selectors: &[(String, Vec<String>)]) -> String {
    let meta = META_METHODS.contains(&method);
    let mut path = resource.to_string();
    let mut query = Vec::new();
    for (name, values) in selectors {
        for value in values {
            if meta && name == "Class" {
                path.push_str(value);
            } else {
                query.push(format!("{}={}", name, value));
            }
        }
    }

    if query.is_empty() {
        return path;
    }
    let separator = if path.contains('?') { ',' } else { '?' };
    format!("{}{}{}", path, separator, query.join(","))
}

fn write_payload(xml: &str) -> Result<TempPath> {
    let mut file = NamedTempFile::new()?;
    file.write_all(xml.as_bytes())?;
    file.flush()?;
    Ok(file.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Operation, ParamValue};
    use crate::config::Defaults;

    #[derive(Default)]
    struct FixedEndpoints {
        calls: usize,
    }

    impl Endpoints for FixedEndpoints {
        fn resolve_url(&mut self, _method: &str, _class_ref: &str, _select: &EprSelect) -> Result<String> {
            self.calls += 1;
            Ok("http://schemas.dell.com/wbem/wscim/1/cim-schema/2/DCIM_CSPowerManagementService?CreationClassName=DCIM_CSPowerManagementService+Name=pwrmgtsvc:1".to_string())
        }

        fn resolve_address(&mut self, _method: &str, _class_ref: &str, param: &str, _select: &EprSelect) -> Result<String> {
            self.calls += 1;
            Ok(format!("  <p:{}>ref</p:{}>\r\n", param, param))
        }
    }

    fn text(s: &str) -> Option<ParamValue> {
        Some(ParamValue::Text(s.to_string()))
    }

    fn catalog() -> Catalog {
        let mut catalog = Catalog::default();
        let mut job = Operation {
            verb: Verb::Invoke,
            target: "cimv2/root/dcim/DCIM_RAIDService?CreationClassName=DCIM_RAIDService+Name=DCIM:RAIDService".to_string(),
            action: Some("CreateTargetedConfigJob".to_string()),
            selectors: BTreeMap::new(),
            params: BTreeMap::new(),
        };
        job.params.insert("Target".to_string(), ParamSpec { default: None, example: text("RAID.Integrated.1-1") });
        job.params.insert("RebootJobType".to_string(), ParamSpec { default: text(""), example: text("3") });
        job.params.insert("RealTime".to_string(), ParamSpec { default: text("1"), example: None });
        catalog.insert("idrac", "CreateRAIDConfigJob", job);

        let mut power = Operation {
            verb: Verb::Invoke,
            target: "EPR:CIM_PowerManagementService".to_string(),
            action: Some("RequestPowerStateChange".to_string()),
            selectors: BTreeMap::new(),
            params: BTreeMap::new(),
        };
        power.params.insert("PowerState".to_string(), ParamSpec { default: None, example: text("2") });
        power.params.insert("ManagedElement".to_string(), ParamSpec { default: text("EPR:CIM_ComputerSystem"), example: None });
        catalog.insert("idrac", "SetPowerState", power);
        catalog
    }

    fn vars() -> VarStore {
        let mut vars = VarStore::new(&Defaults::default());
        vars.set("$IP", "10.1.1.1").unwrap();
        vars.set("$PASS", "hunter2").unwrap();
        vars
    }

    fn build(line: &[&str], endpoints: &mut FixedEndpoints) -> Result<Request> {
        let catalog = catalog();
        let vars = vars();
        let transport = TransportConfig::default();
        let ctx = BuildContext { catalog: &catalog, vars: &vars, transport: &transport };
        let tokens: Vec<String> = line.iter().map(|s| s.to_string()).collect();
        ctx.build(&Call::from_tokens(&tokens, &vars.password())?, endpoints)
    }

    #[test]
    fn invoke_with_key_params() {
        let mut endpoints = FixedEndpoints::default();
        let request = build(&["CreateRAIDConfigJob", "Target=RAID.Integrated.1-1"], &mut endpoints).unwrap();
        let args = &request.invocation.args;

        assert_eq!(&args[..3], &["invoke", "-a", "CreateTargetedConfigJob"]);
        assert_eq!(
            args[3],
            "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/root/dcim/DCIM_RAIDService?CreationClassName=DCIM_RAIDService,Name=DCIM:RAIDService"
        );
        // name-sorted, empty default omitted
        assert_eq!(&args[4..8], &["-k", "RealTime=1", "-k", "Target=RAID.Integrated.1-1"]);
        assert_eq!(request.invocation.arg_after("-h"), Some("10.1.1.1"));
        assert_eq!(request.invocation.arg_after("-P"), Some("443"));
        assert!(request.payload.is_none());
        assert_eq!(endpoints.calls, 0);
    }

    #[test]
    fn missing_required_parameter_fails_before_resolution() {
        let mut endpoints = FixedEndpoints::default();
        let err = build(&["SetPowerState"], &mut endpoints).unwrap_err();

        assert!(matches!(
            err,
            ReciteError::MissingRequiredParameter { ref param, .. } if param == "PowerState"
        ));
        assert_eq!(endpoints.calls, 0);
    }

    #[test]
    fn unknown_method() {
        let mut endpoints = FixedEndpoints::default();
        assert!(matches!(
            build(&["NoSuchMethod"], &mut endpoints),
            Err(ReciteError::UnknownMethod(_))
        ));
    }

    #[test]
    fn file_mode_writes_payload() {
        let mut endpoints = FixedEndpoints::default();
        let request = build(&["SetPowerState", "PowerState=2"], &mut endpoints).unwrap();
        let payload = request.payload.as_deref().unwrap();

        assert!(payload.starts_with(
            "<p:RequestPowerStateChange_INPUT xmlns:p=\"http://schemas.dell.com/wbem/wscim/1/cim-schema/2/DCIM_CSPowerManagementService\">\r\n"
        ));
        assert!(payload.contains("  <p:ManagedElement>ref</p:ManagedElement>\r\n"));
        assert!(payload.contains("  <p:PowerState>2</p:PowerState>\r\n"));
        assert!(payload.ends_with("</p:RequestPowerStateChange_INPUT>\r\n"));
        assert_eq!(endpoints.calls, 2);

        let path = request.invocation.arg_after("-J").unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), payload);
        assert!(!request.invocation.args.contains(&"-k".to_string()));
    }

    #[test]
    fn meta_method_puts_class_in_path() {
        let mut endpoints = FixedEndpoints::default();
        let request = build(&["GetEPR", "Class=CIM_ComputerSystem"], &mut endpoints).unwrap();
        let args = &request.invocation.args;

        assert_eq!(args[0], "enumerate");
        assert_eq!(
            args[1],
            "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ComputerSystem?__cimnamespace=root/dcim"
        );
        assert!(args.ends_with(&["-M".to_string(), "epr".to_string()]));
    }

    #[test]
    fn file_reference_must_exist() {
        let mut endpoints = FixedEndpoints::default();
        let err = build(&["CreateRAIDConfigJob", "Target=file:/nonexistent/target.txt"], &mut endpoints).unwrap_err();
        assert!(matches!(err, ReciteError::FileReference { .. }));

        let mut target = NamedTempFile::new().unwrap();
        write!(target, "RAID.Slot.2-1").unwrap();
        let arg = format!("Target=file:{}", target.path().display());
        let request = build(&["CreateRAIDConfigJob", &arg], &mut endpoints).unwrap();
        assert!(request.invocation.args.contains(&"Target=RAID.Slot.2-1".to_string()));
    }

    #[test]
    fn filter_dialect_and_masked_display() {
        let mut endpoints = FixedEndpoints::default();
        let request = build(&["GetClass", "Class=DCIM_NICView", "-cql=select * from DCIM_NICView"], &mut endpoints).unwrap();
        let args = &request.invocation.args;

        assert!(args.contains(&format!("--dialect={}", DIALECT_CQL)));
        assert!(args.contains(&"--filter=select * from DCIM_NICView".to_string()));

        let shown = request.invocation.to_string();
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("-p ******"));
    }

    #[test]
    fn missing_ip_is_reported() {
        let catalog = catalog();
        let vars = VarStore::new(&Defaults::default());
        let transport = TransportConfig::default();
        let ctx = BuildContext { catalog: &catalog, vars: &vars, transport: &transport };
        let call = Call::new("CreateRAIDConfigJob").with("Target", "x");
        assert!(matches!(
            ctx.build(&call, &mut FixedEndpoints::default()),
            Err(ReciteError::Script(_))
        ));
    }
}
