/// Endpoint reference resolution: `EPR:<Class>` targets are discovered with
/// a `GetEPR` round trip and cached per host.
use std::collections::HashMap;

use crate::error::{ReciteError, Result};
use crate::request::{BuildContext, Call};
use crate::response::{Response, Tree};
use crate::transport::Transport;
use crate::vars::IP;

const ADDRESS_NS_A: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const ADDRESS_NS_W: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

/// `-eprselect=Name=Value,Param|Name=Value,...`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EprSelect {
    global: Option<String>,
    specific: HashMap<String, String>,
}

impl EprSelect {
    pub fn parse(text: &str) -> Self {
        let mut select = Self::default();
        for part in text.split(',').filter(|p| !p.is_empty()) {
            match part.split_once('|') {
                Some((param, pair)) => {
                    select.specific.insert(param.to_string(), pair.to_string());
                }
                None => select.global = Some(part.to_string()),
            }
        }
        select
    }

    /// The `Name=Value` pair that applies to `param`; specific wins.
    pub fn for_param(&self, param: &str) -> Option<&str> {
        self.specific
            .get(param)
            .or(self.global.as_ref())
            .map(String::as_str)
    }

    fn cache_key(&self, param: &str) -> String {
        match self.for_param(param) {
            Some(pair) => format!("{}-{}", param, pair),
            None => param.to_string(),
        }
    }
}

/// Resolves discovered addresses while a request is built.
pub trait Endpoints {
    /// Resource URI with selectors for an `EPR:` target.
    fn resolve_url(&mut self, method: &str, class_ref: &str, select: &EprSelect) -> Result<String>;

    /// Address reference XML for an `EPR:` body parameter.
    fn resolve_address(
        &mut self,
        method: &str,
        class_ref: &str,
        param: &str,
        select: &EprSelect,
    ) -> Result<String>;
}

/// Resolved addresses keyed by host, class reference and parameter key.
#[derive(Debug, Default)]
pub struct EprCache {
    entries: HashMap<(String, String, String), String>,
}

impl EprCache {
    pub fn get(&self, host: &str, class_ref: &str, key: &str) -> Option<&String> {
        self.entries
            .get(&(host.to_string(), class_ref.to_string(), key.to_string()))
    }

    pub fn insert(&mut self, host: &str, class_ref: &str, key: &str, value: String) {
        self.entries
            .insert((host.to_string(), class_ref.to_string(), key.to_string()), value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One selector set from a `GetEPR` response, paired with its resource URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub uri: String,
    pub selectors: Vec<(String, String)>,
}

impl Candidate {
    /// `uri?k=v+k2=v2`
    pub fn url(&self) -> String {
        if self.selectors.is_empty() {
            return self.uri.clone();
        }
        let pairs: Vec<String> = self
            .selectors
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("{}?{}", self.uri, pairs.join("+"))
    }

    pub fn address_xml(&self, param: &str) -> String {
        let selectors: Vec<String> = self
            .selectors
            .iter()
            .map(|(k, v)| format!("        <w:Selector Name=\"{}\">{}</w:Selector>", k, v))
            .collect();

        format!(
            "  <p:{param} xmlns:a=\"{a}\" xmlns:w=\"{w}\">\n\
             \t<a:Address>{anon}</a:Address>\n\
             \t<a:ReferenceParameters>\n\
             \t  <w:ResourceURI>{uri}</w:ResourceURI>\n\
             \t  <w:SelectorSet>\n\
             {selectors}\n\
             \t  </w:SelectorSet>\n\
             \t</a:ReferenceParameters>\n  </p:{param}>\n",
            param = param,
            a = ADDRESS_NS_A,
            w = ADDRESS_NS_W,
            anon = ANONYMOUS,
            uri = self.uri,
            selectors = selectors.join("\n"),
        )
    }
}

/// Pick the candidate for `param` from a discovery response.
pub fn select_candidate(
    tree: &Tree,
    method: &str,
    param: &str,
    select: &EprSelect,
) -> Result<Candidate> {
    let (sets, uris) = collect_candidates(tree);

    let wanted = select.for_param(param).and_then(|pair| pair.split_once('='));
    let index = match wanted {
        None => (!sets.is_empty()).then_some(0),
        Some((name, value)) => sets
            .iter()
            .position(|set| set.iter().any(|(k, v)| k == name && v == value)),
    };

    let Some(index) = index else {
        return Err(ReciteError::AddressResolution {
            method: method.to_string(),
            reason: format!(
                "EPR filter failed - '{}' not found",
                select.for_param(param).unwrap_or_default()
            ),
        });
    };

    let uri = uris.get(index).cloned().ok_or_else(|| ReciteError::AddressResolution {
        method: method.to_string(),
        reason: format!("no resource URI for instance {}", index + 1),
    })?;

    Ok(Candidate {
        uri,
        selectors: sets[index].clone(),
    })
}

fn collect_candidates(tree: &Tree) -> (Vec<Vec<(String, String)>>, Vec<String>) {
    let mut sets = Vec::new();
    let mut uris = Vec::new();
    for id in 0..tree.len() {
        let node = tree.node(id);
        match node.local.as_str() {
            "SelectorSet" => {
                let set = node
                    .children
                    .iter()
                    .map(|&c| tree.node(c))
                    .filter(|n| n.local == "Selector")
                    .filter_map(|n| {
                        let name = n.attr("Name").filter(|name| !name.is_empty())?;
                        Some((name.to_string(), n.text.clone().unwrap_or_default()))
                    })
                    .collect();
                sets.push(set);
            }
            "ResourceURI" => uris.push(node.text.clone().unwrap_or_default()),
            _ => {}
        }
    }
    (sets, uris)
}

/// [`Endpoints`] backed by the live transport and the interpreter's cache.
pub struct Resolver<'a> {
    pub ctx: BuildContext<'a>,
    pub transport: &'a mut dyn Transport,
    pub cache: &'a mut EprCache,
}

impl<'a> Resolver<'a> {
    fn resolve(
        &mut self,
        method: &str,
        class_ref: &str,
        param: &str,
        select: &EprSelect,
        render: impl Fn(&Candidate) -> String,
    ) -> Result<String> {
        let host = self.ctx.vars.get_str(IP).unwrap_or_default();
        let key = select.cache_key(param);
        if let Some(hit) = self.cache.get(&host, class_ref, &key) {
            log::debug!("EPR cache hit for {} {} on {}", class_ref, key, host);
            return Ok(hit.clone());
        }

        let tree = self.discover(method, class_ref)?;
        let candidate = select_candidate(&tree, method, param, select)?;
        let value = render(&candidate);
        self.cache.insert(&host, class_ref, &key, value.clone());
        Ok(value)
    }

    fn discover(&mut self, method: &str, class_ref: &str) -> Result<Tree> {
        let class = match class_ref.split(':').collect::<Vec<_>>().as_slice() {
            [_, class] => class.to_string(),
            _ => {
                return Err(ReciteError::AddressResolution {
                    method: method.to_string(),
                    reason: format!("invalid EPR declaration '{}'", class_ref),
                })
            }
        };

        let call = Call::new("GetEPR").with("Class", &class);
        let request = self.ctx.build(&call, &mut NoEndpoints)?;
        log::info!("{}", request.invocation);

        let result = self.transport.execute(&request.invocation)?;
        Response::from_output(&result.output)
            .tree
            .ok_or_else(|| ReciteError::AddressResolution {
                method: method.to_string(),
                reason: format!("GetEPR failed for class '{}'", class),
            })
    }
}

impl<'a> Endpoints for Resolver<'a> {
    fn resolve_url(&mut self, method: &str, class_ref: &str, select: &EprSelect) -> Result<String> {
        self.resolve(method, class_ref, "URL", select, Candidate::url)
    }

    fn resolve_address(
        &mut self,
        method: &str,
        class_ref: &str,
        param: &str,
        select: &EprSelect,
    ) -> Result<String> {
        self.resolve(method, class_ref, param, select, |c| c.address_xml(param))
    }
}

/// For calls that cannot contain `EPR:` references, such as discovery itself.
struct NoEndpoints;

impl Endpoints for NoEndpoints {
    fn resolve_url(&mut self, method: &str, class_ref: &str, _select: &EprSelect) -> Result<String> {
        Err(ReciteError::AddressResolution {
            method: method.to_string(),
            reason: format!("nested EPR reference '{}'", class_ref),
        })
    }

    fn resolve_address(
        &mut self,
        method: &str,
        class_ref: &str,
        _param: &str,
        _select: &EprSelect,
    ) -> Result<String> {
        self.resolve_url(method, class_ref, &EprSelect::default())
    }
}
