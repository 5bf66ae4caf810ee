/// Control-flow interpreter: owns every piece of session state and runs
/// lines one at a time, either typed at the prompt or read from scripts.
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::catalog::Catalog;
use crate::command::{self, Command, SetCommand};
use crate::config::{Config, TransportConfig, VERBOSE_QUIET, VERBOSE_WSMAN};
use crate::epr::{EprCache, Resolver};
use crate::error::{ReciteError, Result};
use crate::expr;
use crate::extract::{self, FindQuery};
use crate::hosts;
use crate::request::{BuildContext, Call};
use crate::response::{NodeId, Response};
use crate::transport::Transport;
use crate::vars::{Value, VarStore, FORMAT, TIMER, USLEEP, UTIMEOUT, VAR_BATCHFILE, VAR_LINE, VAR_LOCALIP};

/// One script being executed.
#[derive(Debug)]
struct Frame {
    name: String,
    lines: Vec<String>,
    /// Index of the next line to run.
    cursor: usize,
    /// Label name (without `:`) to line index; first occurrence wins.
    labels: HashMap<String, usize>,
    /// Resume points pushed by same-file `Gosub`.
    returns: Vec<usize>,
    entered_by_gosub: bool,
}

impl Frame {
    fn from_source(name: &str, source: &str, entered_by_gosub: bool) -> Self {
        let lines: Vec<String> = source.lines().map(str::to_string).collect();
        let mut labels = HashMap::new();
        for (i, line) in lines.iter().enumerate() {
            if let Some(label) = line.trim().strip_prefix(':') {
                labels.entry(label.trim().to_string()).or_insert(i);
            }
        }

        Self {
            name: name.to_string(),
            lines,
            cursor: 0,
            labels,
            returns: Vec::new(),
            entered_by_gosub,
        }
    }

    fn load(path: &str, entered_by_gosub: bool) -> Result<Self> {
        let source = fs::read_to_string(path)
            .map_err(|e| ReciteError::Script(format!("No such file: {} ({})", path, e)))?;
        Ok(Self::from_source(path, &source, entered_by_gosub))
    }

    /// Line index for `n` (1-based) or a label. A number past the end is
    /// accepted and ends the frame.
    fn locate(&self, target: &str) -> Result<usize> {
        if let Ok(n) = target.trim().parse::<i64>() {
            if n <= 0 {
                return Err(ReciteError::Script(format!("Invalid line number {}", n)));
            }
            return Ok((n - 1) as usize);
        }

        let label = target.trim().trim_start_matches(':');
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| ReciteError::Script(format!("Label '{}' not found in {}", label, self.name)))
    }
}

pub struct Interpreter {
    vars: VarStore,
    catalog: Catalog,
    transport_config: TransportConfig,
    transport: Box<dyn Transport>,
    cache: EprCache,
    response: Response,
    context: Option<NodeId>,
    frames: Vec<Frame>,
    log_file: Option<File>,
    out: Box<dyn Write>,
    quit: bool,
}

impl Interpreter {
    pub fn new(config: &Config, catalog: Catalog, transport: Box<dyn Transport>) -> Self {
        let mut vars = VarStore::new(&config.defaults);
        if let Some(ip) = hosts::local_ip() {
            vars.set_internal(VAR_LOCALIP, Value::Text(ip));
        }

        Self {
            vars,
            catalog,
            transport_config: config.transport.clone(),
            transport,
            cache: EprCache::default(),
            response: Response::default(),
            context: None,
            frames: Vec::new(),
            log_file: None,
            out: Box::new(io::stdout()),
            quit: false,
        }
    }

    /// Send user output somewhere other than stdout.
    pub fn with_output(mut self, out: Box<dyn Write>) -> Self {
        self.out = out;
        self
    }

    pub fn vars(&self) -> &VarStore {
        &self.vars
    }

    pub fn vars_mut(&mut self) -> &mut VarStore {
        &mut self.vars
    }

    /// Most recent response.
    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn is_quit(&self) -> bool {
        self.quit
    }

    /// Run a script file to completion. Returns false if a line failed.
    pub fn run_script(&mut self, path: &str) -> bool {
        match Frame::load(path, false) {
            Ok(frame) => self.run_frame(frame),
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }

    /// Run in-memory script text under `name`.
    pub fn run_source(&mut self, name: &str, source: &str) -> bool {
        self.run_frame(Frame::from_source(name, source, false))
    }

    /// Run one line. Returns false when it failed without the `-` marker.
    pub fn execute_line(&mut self, raw: &str) -> bool {
        let ignore_failure = raw.trim_start().starts_with('-');
        let line = match command::parse_line(raw) {
            Ok(line) => line,
            Err(e) => {
                self.report_failure(&e.to_string());
                return ignore_failure;
            }
        };

        if line.command != Command::Noop && self.vars.verbose() > VERBOSE_WSMAN {
            let stamp = chrono::Local::now().format("%a %b %e %H:%M:%S %Y");
            let line = hosts::mask_credentials(&self.vars.mask(raw.trim()));
            let shown = format!("{}: {}\n", stamp, line);
            self.show(&shown);
        }

        match self.execute(&line.command) {
            Ok(true) => true,
            Ok(false) => {
                self.report_failure(&format!("{} failed", line.command.name()));
                line.ignore_failure
            }
            Err(e) => {
                self.report_failure(&e.to_string());
                line.ignore_failure
            }
        }
    }

    fn report_failure(&self, message: &str) {
        let message = hosts::mask_credentials(&self.vars.mask(message));
        match self.frames.last() {
            Some(frame) => error!(
                "{}:{} - {}",
                frame.name,
                self.vars.int(VAR_LINE).unwrap_or_default(),
                message
            ),
            None => error!("{}", message),
        }
    }

    fn run_frame(&mut self, frame: Frame) -> bool {
        let saved_line = self.vars.get(VAR_LINE);
        let saved_file = self.vars.get(VAR_BATCHFILE);

        let base = self.frames.len();
        self.frames.push(frame);
        let ok = self.drive(base);
        self.frames.truncate(base);

        for (name, saved) in [(VAR_LINE, saved_line), (VAR_BATCHFILE, saved_file)] {
            match saved {
                Some(value) => self.vars.set_internal(name, value),
                None => self.vars.remove_internal(name),
            }
        }
        ok
    }

    /// Execute the top frame until it ends, fails or `Quit` is seen. A
    /// cross-file `Goto` swaps the top frame and the loop carries on in it.
    fn drive(&mut self, base: usize) -> bool {
        while !self.quit && self.frames.len() > base {
            let Some(frame) = self.frames.last_mut() else {
                break;
            };
            if frame.cursor >= frame.lines.len() {
                break;
            }

            let index = frame.cursor;
            frame.cursor += 1;
            let raw = frame.lines[index].clone();
            let name = frame.name.clone();

            self.vars.set_internal(VAR_LINE, Value::Int(index as i64 + 1));
            self.vars.set_internal(VAR_BATCHFILE, Value::Text(name));
            if !self.execute_line(&raw) {
                return false;
            }
        }
        true
    }

    fn execute(&mut self, command: &Command) -> Result<bool> {
        match command {
            Command::Noop => Ok(true),
            Command::Batch(path) => {
                let frame = Frame::load(&self.vars.expand(path), false)?;
                Ok(self.run_frame(frame))
            }
            Command::Clear => {
                crossterm::execute!(
                    io::stdout(),
                    crossterm::terminal::Clear(crossterm::terminal::ClearType::All),
                    crossterm::cursor::MoveTo(0, 0)
                )?;
                Ok(true)
            }
            Command::Context { look, inner } => self.context(look, inner),
            Command::Count(var) => {
                let chunks = self.response.chunks() as i64;
                self.vars.bind(var, Value::Int(chunks))?;
                Ok(true)
            }
            Command::Find { look, var, instance } => {
                Ok(self.find(look, var.as_deref(), instance.as_deref())?.is_some())
            }
            Command::Findall { field, var } => self.find_all(field, var),
            Command::Gosub(target) => self.jump(target, true),
            Command::Goto(target) => self.jump(target, false),
            Command::If { cond, then } => {
                if self.condition(cond)? {
                    self.execute(then)
                } else {
                    Ok(true)
                }
            }
            Command::Log { path, mode } => self.log(path.as_deref(), mode.as_deref()),
            Command::Print(text) => {
                let text = format!("{}\n", self.vars.expand(text));
                self.write_out(&text);
                Ok(true)
            }
            Command::Quit => {
                self.quit = true;
                Ok(true)
            }
            Command::Report { fields, filter } => self.report(fields, filter.as_deref()),
            Command::Return => self.return_from_sub(),
            Command::Set(set) => self.set(set),
            Command::Sleep(seconds) => {
                let text = self.vars.expand(seconds);
                let seconds: u64 = text
                    .trim()
                    .parse()
                    .map_err(|_| ReciteError::Script(format!("Sleep expects whole seconds, got '{}'", text)))?;
                thread::sleep(Duration::from_secs(seconds));
                Ok(true)
            }
            Command::Unset(var) => self.vars.unset(var),
            Command::Until { cond, args } => self.until(cond, args),
            Command::Invoke { call, until, ops } => {
                let ok = match until {
                    Some(cond) => self.until(cond, call)?,
                    None => self.call(call)?,
                };
                if !ok {
                    return Ok(false);
                }
                for op in ops {
                    if !self.execute(op)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Build and run one remote call, replacing the current response.
    fn call(&mut self, tokens: &[String]) -> Result<bool> {
        let tokens: Vec<String> = tokens.iter().map(|t| self.vars.expand_secret(t)).collect();
        let call = Call::from_tokens(&tokens, &self.vars.password())?;

        let ctx = BuildContext {
            catalog: &self.catalog,
            vars: &self.vars,
            transport: &self.transport_config,
        };
        let mut resolver = Resolver {
            ctx,
            transport: self.transport.as_mut(),
            cache: &mut self.cache,
        };
        let built = ctx.build(&call, &mut resolver);
        self.response = Response::default();
        self.context = None;
        let request = built?;

        let shown = request.invocation.to_string();
        let payload = request.payload.clone().unwrap_or_default();
        let verbose = self.vars.verbose();
        if verbose > VERBOSE_QUIET {
            self.show(&format!("{}\n\n", shown));
            if !payload.is_empty() {
                self.show(&payload);
            }
        }

        let started = Instant::now();
        let result = self.transport.execute(&request.invocation);
        drop(request.payload_file);
        let result = result?;
        debug!("{} returned {} bytes", request.method, result.output.len());

        let response = Response::from_output(&result.output);
        if !response.is_empty() && verbose > VERBOSE_QUIET {
            let format = self.vars.get_str(FORMAT).unwrap_or_default();
            self.show(&response.render(&format));
        }
        self.tee(&format!("{}\n{}\n{}\n\n", shown, payload, response.xml));

        if self.vars.flag(TIMER) {
            let timer = format!(
                "TIMER: {} - {} msecs\n\n",
                request.method,
                started.elapsed().as_millis()
            );
            self.write_out(&timer);
        }

        self.response = response;
        Ok(!self.response.is_empty())
    }

    fn scope(&self) -> Option<NodeId> {
        let tree = self.response.tree.as_ref()?;
        Some(self.context.unwrap_or_else(|| tree.root()))
    }

    /// `Find`; the match is returned so `Context` can narrow to its parent.
    fn find(&mut self, look: &str, var: Option<&str>, instance: Option<&str>) -> Result<Option<extract::Match>> {
        let look = self.vars.expand(look);
        let instance = match instance.map(|i| self.vars.expand(i)) {
            Some(text) => match text.trim().parse::<usize>() {
                Ok(n) if n >= 1 => Some(n),
                _ => return Ok(None),
            },
            None => None,
        };
        if let Some(var) = var {
            self.vars.clear(var);
        }

        let query = FindQuery::parse(&look, instance)
            .ok_or_else(|| ReciteError::Script(format!("Find expects Name or Name=Value, got '{}'", look)))?;
        let (Some(tree), Some(scope)) = (self.response.tree.as_ref(), self.scope()) else {
            warn!("No data extracted from the last response");
            return Ok(None);
        };

        let found = extract::find(tree, scope, &query);
        if let (Some(var), Some(m)) = (var, &found) {
            self.vars.bind(var, Value::Text(m.value.clone()))?;
        }
        Ok(found)
    }

    fn find_all(&mut self, field: &str, var: &str) -> Result<bool> {
        let field = self.vars.expand(field);
        self.vars.clear(var);

        let (Some(tree), Some(scope)) = (self.response.tree.as_ref(), self.scope()) else {
            warn!("No data extracted from the last response");
            return Ok(false);
        };
        let values: Vec<String> = extract::find_all(tree, scope, &field, None)
            .into_iter()
            .map(|m| m.value)
            .collect();
        if values.is_empty() {
            return Ok(false);
        }

        self.vars.bind(var, Value::List(values))?;
        Ok(true)
    }

    fn context(&mut self, look: &str, inner: &Command) -> Result<bool> {
        let expanded = self.vars.expand(look);
        if expanded.split('=').count() != 2 {
            return Err(ReciteError::MalformedCondition(expanded));
        }

        let Some(found) = self.find(&expanded, None, None)? else {
            return Err(ReciteError::Script(format!("Context {} not found", expanded)));
        };
        self.context = found.parent.or(Some(found.node));

        let result = self.execute(inner);
        self.context = None;
        result
    }

    fn report(&mut self, fields: &str, filter: Option<&str>) -> Result<bool> {
        let fields: Vec<String> = self
            .vars
            .expand(fields)
            .split(',')
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();

        let filter = match filter.map(|f| self.vars.expand(f)) {
            Some(text) => match text.split_once('=') {
                Some((k, v)) => Some((k.to_string(), v.to_string())),
                None => return Err(ReciteError::MalformedCondition(text.clone())),
            },
            None => None,
        };
        let filter = filter.as_ref().map(|(k, v)| (k.as_str(), v.as_str()));

        match extract::report(&self.response, self.context, &fields, filter) {
            Some(table) => {
                self.write_out(&table);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// `a=b`, `a==b` or `a!=b`, compared after substitution.
    fn condition(&self, cond: &str) -> Result<bool> {
        let (lhs, rhs, equal) = if let Some((l, r)) = cond.split_once("!=") {
            (l, r, false)
        } else if let Some((l, r)) = cond.split_once("==") {
            (l, r, true)
        } else if let Some((l, r)) = cond.split_once('=') {
            (l, r, true)
        } else {
            return Err(ReciteError::MalformedCondition(cond.to_string()));
        };

        Ok((self.vars.expand(lhs) == self.vars.expand(rhs)) == equal)
    }

    fn jump(&mut self, target: &str, sub: bool) -> Result<bool> {
        if self.frames.is_empty() {
            return Err(ReciteError::Script("Not in batch mode".to_string()));
        }
        let target = self.vars.expand(target);

        let cross_file = match target.split_once(':') {
            Some((file, at)) if !file.is_empty() => Some((file.to_string(), at.to_string())),
            None if target.ends_with(".win") => Some((target.clone(), String::new())),
            _ => None,
        };

        if let Some((file, at)) = cross_file {
            let entered_by_gosub = sub || self.frames.last().is_some_and(|f| f.entered_by_gosub);
            let mut frame = Frame::load(&file, entered_by_gosub)?;
            if !at.is_empty() {
                frame.cursor = frame.locate(&at)?;
            }
            if sub {
                return Ok(self.run_frame(frame));
            }
            if let Some(top) = self.frames.last_mut() {
                *top = frame;
            }
            return Ok(true);
        }

        let Some(frame) = self.frames.last_mut() else {
            return Ok(false);
        };
        let index = frame.locate(&target)?;
        if sub {
            frame.returns.push(frame.cursor);
        }
        frame.cursor = index;
        Ok(true)
    }

    fn return_from_sub(&mut self) -> Result<bool> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| ReciteError::Script("Not in batch mode".to_string()))?;

        match frame.returns.pop() {
            Some(resume) => frame.cursor = resume,
            None if frame.entered_by_gosub => frame.cursor = frame.lines.len(),
            None => return Err(ReciteError::Script("Return without Gosub".to_string())),
        }
        Ok(true)
    }

    fn set(&mut self, set: &SetCommand) -> Result<bool> {
        match set {
            SetCommand::List => {
                let listing = self.vars.listing().join("\n");
                self.write_out(&format!("{}\n", listing));
            }
            SetCommand::Assign { name, value } => {
                let value = self.vars.expand(value);
                self.vars.set(name, &value)?;
            }
            SetCommand::Eval { name, expr } => {
                let value = expr::evaluate(&self.vars.expand(expr))?;
                self.vars.set(name, &value.to_string())?;
            }
        }
        Ok(true)
    }

    fn log(&mut self, path: Option<&str>, mode: Option<&str>) -> Result<bool> {
        self.log_file = None;
        let Some(path) = path.map(|p| self.vars.expand(p)) else {
            return Ok(true);
        };

        let append = match mode.map(|m| self.vars.expand(m)).as_deref() {
            None | Some("w") => false,
            Some("a") => true,
            Some(other) => {
                return Err(ReciteError::Script(format!("Unknown log mode '{}', expected w or a", other)))
            }
        };

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)?;
        self.log_file = Some(file);
        Ok(true)
    }

    /// Poll `method` until `field=value` appears in its response.
    fn until(&mut self, cond: &str, args: &[String]) -> Result<bool> {
        let cond = self.vars.expand(cond);
        let (field, value) = match cond.split('=').collect::<Vec<_>>().as_slice() {
            [field, value] => (field.to_string(), value.to_string()),
            _ => return Err(ReciteError::MalformedCondition(cond.clone())),
        };

        let timing = match args {
            [interval, timeout, rest @ ..] if !rest.is_empty() => {
                match (
                    self.vars.expand(interval).trim().parse::<u64>(),
                    self.vars.expand(timeout).trim().parse::<u64>(),
                ) {
                    (Ok(i), Ok(t)) => Some((i, t, rest)),
                    _ => None,
                }
            }
            _ => None,
        };
        let (interval, timeout, method) =
            timing.unwrap_or_else(|| (self.seconds(USLEEP), self.seconds(UTIMEOUT), args));
        if method.is_empty() {
            return Err(ReciteError::Script("Until requires a method to poll".to_string()));
        }

        let query = FindQuery {
            field: field.clone(),
            expected: Some(value.clone()),
            instance: None,
        };
        let started = Instant::now();
        loop {
            if !self.call(method)? {
                return Ok(false);
            }

            let Some(tree) = self.response.tree.as_ref() else {
                return Ok(false);
            };
            if extract::find(tree, tree.root(), &query).is_some() {
                return Ok(true);
            }

            if self.vars.verbose() > VERBOSE_WSMAN {
                let actual = extract::find_all(tree, tree.root(), &field, Some(1))
                    .into_iter()
                    .next()
                    .map(|m| format!(" [{}]", m.value))
                    .unwrap_or_default();
                self.show(&format!("  Until: {} != {}{}\n", field, value, actual));
            }

            thread::sleep(Duration::from_secs(interval));
            if started.elapsed() > Duration::from_secs(timeout) {
                return Err(ReciteError::Timeout(timeout));
            }
        }
    }

    fn seconds(&self, name: &str) -> u64 {
        self.vars.int(name).unwrap_or_default().max(0) as u64
    }

    /// Echo to the terminal only.
    fn show(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|_| self.out.flush()) {
            warn!("Failed to write output: {}", e);
        }
    }

    /// User output: terminal and the `Log` file.
    fn write_out(&mut self, text: &str) {
        self.show(text);
        self.tee(text);
    }

    fn tee(&mut self, text: &str) {
        if let Some(file) = self.log_file.as_mut() {
            if let Err(e) = file.write_all(text.as_bytes()) {
                warn!("Failed to write log file: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{BTreeMap, VecDeque};
    use std::rc::Rc;

    use crate::catalog::{Operation, ParamSpec, Verb};
    use crate::response::tests::ENUMERATION;
    use crate::transport::{CommandResult, Invocation};

    #[derive(Default)]
    struct Script {
        outputs: VecDeque<String>,
        calls: Vec<Invocation>,
    }

    /// Replays canned outputs and records every invocation.
    #[derive(Clone, Default)]
    struct ScriptedTransport(Rc<RefCell<Script>>);

    impl ScriptedTransport {
        fn push(&self, output: &str) {
            self.0.borrow_mut().outputs.push_back(output.to_string());
        }

        fn calls(&self) -> usize {
            self.0.borrow().calls.len()
        }
    }

    impl Transport for ScriptedTransport {
        fn execute(&mut self, invocation: &Invocation) -> Result<CommandResult> {
            let mut script = self.0.borrow_mut();
            script.calls.push(invocation.clone());
            Ok(CommandResult {
                output: script.outputs.pop_front().unwrap_or_default(),
                exit_status: 0,
            })
        }
    }

    #[derive(Clone, Default)]
    struct Captured(Rc<RefCell<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    fn job(status: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:n1="http://schemas.dell.com/wbem/wscim/1/cim-schema/2/DCIM_LifecycleJob">
  <s:Body>
    <n1:DCIM_LifecycleJob>
      <n1:InstanceID>JID_001</n1:InstanceID>
      <n1:JobStatus>{}</n1:JobStatus>
    </n1:DCIM_LifecycleJob>
  </s:Body>
</s:Envelope>
"#,
            status
        )
    }

    fn catalog() -> Catalog {
        let mut catalog = Catalog::default();
        catalog.insert(
            "idrac",
            "GetRAIDControllers",
            Operation {
                verb: Verb::Enumerate,
                target: "cimv2/root/dcim/DCIM_ControllerView".to_string(),
                action: None,
                selectors: BTreeMap::new(),
                params: BTreeMap::new(),
            },
        );

        let mut selectors = BTreeMap::new();
        selectors.insert("InstanceID".to_string(), ParamSpec { default: None, example: None });
        catalog.insert(
            "idrac",
            "GetJob",
            Operation {
                verb: Verb::Get,
                target: "cimv2/root/dcim/DCIM_LifecycleJob".to_string(),
                action: None,
                selectors,
                params: BTreeMap::new(),
            },
        );
        catalog
    }

    fn interpreter() -> (Interpreter, ScriptedTransport, Captured) {
        let transport = ScriptedTransport::default();
        let out = Captured::default();
        let mut interp = Interpreter::new(&Config::default(), catalog(), Box::new(transport.clone()))
            .with_output(Box::new(out.clone()));
        interp.vars_mut().set("$IP", "10.0.0.1").unwrap();
        interp.vars_mut().set("$VERBOSE", "0").unwrap();
        (interp, transport, out)
    }

    fn text(interp: &Interpreter, name: &str) -> Option<String> {
        interp.vars().get_str(name)
    }

    #[test]
    fn gosub_returns_to_the_line_after_the_call() {
        let (mut interp, _, _) = interpreter();
        let ok = interp.run_source(
            "main.win",
            "Set $trail a\n\
             Gosub Sub\n\
             Set $trail $trail-c\n\
             Goto End\n\
             :Sub\n\
             Set $trail $trail-b\n\
             Return\n\
             :End\n",
        );

        assert!(ok);
        assert_eq!(text(&interp, "$trail").as_deref(), Some("a-b-c"));
        assert!(!interp.vars().contains(VAR_LINE));
    }

    #[test]
    fn failing_line_aborts_the_frame_unless_suppressed() {
        let (mut interp, _, _) = interpreter();
        assert!(!interp.run_source("a.win", "Find Missing\nSet $after 1\n"));
        assert!(!interp.vars().contains("$after"));

        assert!(interp.run_source("b.win", "-Find Missing\nSet $after 1\n"));
        assert_eq!(text(&interp, "$after").as_deref(), Some("1"));
    }

    #[test]
    fn jumps_need_a_script() {
        let (mut interp, _, _) = interpreter();
        assert!(!interp.execute_line("Goto 3"));
        assert!(!interp.execute_line("Return"));
    }

    #[test]
    fn bad_line_numbers() {
        let (mut interp, _, _) = interpreter();
        assert!(!interp.run_source("zero.win", "Goto 0\n"));
        assert!(interp.run_source("past.win", "Goto 99\nSet $never 1\n"));
        assert!(!interp.vars().contains("$never"));
        assert!(!interp.run_source("ret.win", "Return\n"));
    }

    #[test]
    fn cross_file_gosub_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib.win");
        fs::write(&lib, "Set $skipped 1\n:Start\nSet $x 1\nReturn\nSet $unreached 1\n").unwrap();

        let (mut interp, _, _) = interpreter();
        let main = format!("Gosub {}:Start\nSet $y 2\n", lib.display());
        assert!(interp.run_source("main.win", &main));
        assert_eq!(text(&interp, "$x").as_deref(), Some("1"));
        assert_eq!(text(&interp, "$y").as_deref(), Some("2"));
        assert!(!interp.vars().contains("$skipped"));
        assert!(!interp.vars().contains("$unreached"));
    }

    #[test]
    fn cross_file_goto_replaces_the_frame() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("other.win");
        fs::write(&other, "Set $line $_LINE\n").unwrap();

        let (mut interp, _, _) = interpreter();
        let main = format!("Goto {}:1\nSet $after 1\n", other.display());
        assert!(interp.run_source("main.win", &main));
        assert_eq!(text(&interp, "$line").as_deref(), Some("1"));
        assert!(!interp.vars().contains("$after"));
    }

    #[test]
    fn if_and_set_shorthands() {
        let (mut interp, _, _) = interpreter();
        assert!(interp.execute_line("$a=1"));
        assert!(interp.execute_line("?$a=1 $b=yes"));
        assert!(interp.execute_line("?$a!=1 $c=no"));
        assert!(interp.execute_line("$n:=($a+2)*3"));

        assert_eq!(text(&interp, "$b").as_deref(), Some("yes"));
        assert!(!interp.vars().contains("$c"));
        assert_eq!(text(&interp, "$n").as_deref(), Some("9"));
        assert!(!interp.execute_line("If $a Print x"));
    }

    #[test]
    fn invoke_with_extraction_operators() {
        let (mut interp, transport, out) = interpreter();
        transport.push(ENUMERATION);

        assert!(interp.execute_line("GetRAIDControllers /$first=FQDD /*$all=FQDD +$n '<found $first'"));
        assert_eq!(text(&interp, "$first").as_deref(), Some("RAID.Integrated.1-1"));
        assert_eq!(text(&interp, "$all").as_deref(), Some("RAID.Integrated.1-1,AHCI.Embedded.1-1"));
        assert_eq!(text(&interp, "$n").as_deref(), Some("2"));
        assert!(out.text().contains("found RAID.Integrated.1-1\n"));

        assert!(interp.execute_line("//FQDD=AHCI.Embedded.1-1 /$name=ProductName"));
        assert_eq!(text(&interp, "$name").as_deref(), Some("S110"));
        assert!(!interp.execute_line("//FQDD=Missing.1 /$name=ProductName"));
    }

    #[test]
    fn find_clears_its_variable_on_failure() {
        let (mut interp, transport, _) = interpreter();
        transport.push(ENUMERATION);
        assert!(interp.execute_line("GetRAIDControllers"));

        assert!(interp.execute_line("Find FQDD $v 2"));
        assert_eq!(text(&interp, "$v").as_deref(), Some("AHCI.Embedded.1-1"));
        assert!(!interp.execute_line("Find FQDD $v 3"));
        assert!(!interp.vars().contains("$v"));
        assert!(!interp.execute_line("Find FQDD $v 0"));
    }

    #[test]
    fn missing_parameter_never_reaches_the_transport() {
        let (mut interp, transport, _) = interpreter();
        assert!(!interp.execute_line("GetJob"));
        assert_eq!(transport.calls(), 0);
        assert!(!interp.execute_line("NoSuchMethod"));
        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn until_polls_until_the_value_appears() {
        let (mut interp, transport, _) = interpreter();
        transport.push(&job("Running"));
        transport.push(&job("Running"));
        transport.push(&job("Completed"));

        let started = Instant::now();
        assert!(interp.execute_line("Until JobStatus=Completed 1 10 GetJob InstanceID=JID_001"));
        assert_eq!(transport.calls(), 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn until_stops_on_empty_output() {
        let (mut interp, transport, _) = interpreter();
        interp.vars_mut().set("$USLEEP", "0").unwrap();
        transport.push(&job("Running"));

        assert!(!interp.execute_line("GetJob InstanceID=JID_001 {JobStatus=Completed"));
        assert_eq!(transport.calls(), 2);
    }

    #[test]
    fn until_times_out() {
        let (mut interp, transport, _) = interpreter();
        for _ in 0..3 {
            transport.push(&job("Running"));
        }
        assert!(!interp.execute_line("Until JobStatus=Completed 1 0 GetJob InstanceID=JID_001"));
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn report_prints_filtered_rows() {
        let (mut interp, transport, out) = interpreter();
        transport.push(ENUMERATION);
        assert!(interp.execute_line("GetRAIDControllers"));
        assert!(interp.execute_line("<<FQDD,ProductName //RollupStatus=2"));

        let shown = out.text();
        assert!(shown.contains("AHCI.Embedded.1-1"));
        assert!(!shown.contains("PERC H710P"));
        assert!(!interp.execute_line("Report Missing"));
    }

    #[test]
    fn echo_and_listing_mask_the_password() {
        let (mut interp, transport, out) = interpreter();
        interp.vars_mut().set("$PASS", "s3cr3t").unwrap();
        interp.vars_mut().set("$VERBOSE", "1").unwrap();
        transport.push(ENUMERATION);

        assert!(interp.execute_line("GetRAIDControllers"));
        assert!(interp.execute_line("Set"));
        assert!(interp.execute_line("Print $PASS"));

        let shown = out.text();
        assert!(!shown.contains("s3cr3t"));
        assert!(shown.contains("$PASS: ******"));
        assert_eq!(transport.0.borrow().calls[0].arg_after("-p"), Some("s3cr3t"));
    }

    #[test]
    fn log_file_records_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        let (mut interp, transport, _) = interpreter();
        transport.push(ENUMERATION);

        assert!(interp.execute_line(&format!("Log {}", path.display())));
        assert!(interp.execute_line("GetRAIDControllers"));
        assert!(interp.execute_line("Print done"));
        assert!(interp.execute_line("Log"));

        let logged = fs::read_to_string(&path).unwrap();
        assert!(logged.starts_with("wsman enumerate"));
        assert!(logged.contains("<n1:FQDD>RAID.Integrated.1-1</n1:FQDD>"));
        assert!(logged.ends_with("done\n"));
        assert!(!interp.execute_line(&format!("Log {} x", path.display())));
    }

    #[test]
    fn quit_stops_every_frame() {
        let (mut interp, _, _) = interpreter();
        assert!(interp.run_source("q.win", "Set $a 1\nQuit\nSet $b 1\n"));
        assert!(interp.is_quit());
        assert!(!interp.vars().contains("$b"));
    }

    #[test]
    fn unset_rules() {
        let (mut interp, _, _) = interpreter();
        assert!(interp.execute_line("$tmp=1"));
        assert!(interp.execute_line("~$tmp"));
        assert!(!interp.execute_line("~$tmp"));
        assert!(!interp.execute_line("Unset $IP"));
    }
}
