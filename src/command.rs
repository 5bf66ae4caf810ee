/// Command dispatcher: turns one script or prompt line into a typed
/// [`Command`], expanding the shorthand operators.
///
/// ```text
/// -GetRAIDControllers /$ctlr=FQDD      # invoke, then Find FQDD $ctlr
/// ?$ctlr=RAID.Integrated.1-1 >>:Setup  # If ... Gosub :Setup
/// <<FQDD,ProductName //RollupStatus=1  # Report ... where RollupStatus=1
/// ```
use std::path::Path;

use crate::error::{ReciteError, Result};

const USAGE_BATCH: &str = "Batch Filename.win";
const USAGE_CONTEXT: &str = "Context Name=Value Command [args]  |  //Name=Value Command";
const USAGE_COUNT: &str = "Count $var  |  +$var";
const USAGE_FIND: &str = "Find Name[=Value] [$var [instance]]  |  /Name[=Value]  |  /$var=Name";
const USAGE_FINDALL: &str = "Findall Name $var  |  /*$var=Name";
const USAGE_GOTO: &str = "Goto line|Label|file[:line|Label]  |  >target  |  >>target";
const USAGE_IF: &str = "If Name=Value|Name!=Value Command  |  ?cond Command";
const USAGE_LOG: &str = "Log [filename [mode]]";
const USAGE_PRINT: &str = "Print text  |  <text";
const USAGE_REPORT: &str = "Report Field,Field,* [where Name=Value]  |  <<fields [//Name=Value]";
const USAGE_SET: &str = "Set [$var value | /a $var expr]  |  $var=value  |  $var:=expr  |  $";
const USAGE_SLEEP: &str = "Sleep seconds";
const USAGE_UNSET: &str = "Unset $var  |  ~$var";
const USAGE_UNTIL: &str = "Until Name=Value [interval timeout] Method [args]  |  {cond Method [args]";

/// A line with its failure-suppression marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// `-` prefix: a failure is reported but does not abort the frame.
    pub ignore_failure: bool,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetCommand {
    /// `Set` alone lists every variable.
    List,
    Assign { name: String, value: String },
    Eval { name: String, expr: String },
}

/// Arguments are kept unexpanded; variables are substituted when the
/// command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Blank line, comment or label.
    Noop,
    Batch(String),
    Clear,
    Context {
        look: String,
        inner: Box<Command>,
    },
    Count(String),
    Find {
        look: String,
        var: Option<String>,
        instance: Option<String>,
    },
    Findall {
        field: String,
        var: String,
    },
    Gosub(String),
    Goto(String),
    If {
        cond: String,
        then: Box<Command>,
    },
    Log {
        path: Option<String>,
        mode: Option<String>,
    },
    Print(String),
    Quit,
    Report {
        fields: String,
        filter: Option<String>,
    },
    Return,
    Set(SetCommand),
    Sleep(String),
    Unset(String),
    Until {
        cond: String,
        args: Vec<String>,
    },
    /// Remote method call with trailing operators run against its output.
    Invoke {
        call: Vec<String>,
        until: Option<String>,
        ops: Vec<Command>,
    },
}

impl Command {
    /// Name used in failure reports.
    pub fn name(&self) -> &str {
        match self {
            Command::Noop => "Noop",
            Command::Batch(_) => "Batch",
            Command::Clear => "Clear",
            Command::Context { .. } => "Context",
            Command::Count(_) => "Count",
            Command::Find { .. } => "Find",
            Command::Findall { .. } => "Findall",
            Command::Gosub(_) => "Gosub",
            Command::Goto(_) => "Goto",
            Command::If { .. } => "If",
            Command::Log { .. } => "Log",
            Command::Print(_) => "Print",
            Command::Quit => "Quit",
            Command::Report { .. } => "Report",
            Command::Return => "Return",
            Command::Set(_) => "Set",
            Command::Sleep(_) => "Sleep",
            Command::Unset(_) => "Unset",
            Command::Until { .. } => "Until",
            Command::Invoke { call, .. } => call.first().map(String::as_str).unwrap_or("Invoke"),
        }
    }
}

/// Parse a raw line, honouring comments, labels and the `-` prefix.
pub fn parse_line(raw: &str) -> Result<Line> {
    let text = raw.trim();
    if text.is_empty() || text.starts_with('#') || text.starts_with(':') {
        return Ok(Line {
            ignore_failure: false,
            command: Command::Noop,
        });
    }

    let (ignore_failure, text) = match text.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, text),
    };

    Ok(Line {
        ignore_failure,
        command: parse_command(text)?,
    })
}

/// Parse a command without the line-level prefixes.
pub fn parse_command(text: &str) -> Result<Command> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Command::Noop);
    }

    let tokens = shell_words::split(text)
        .map_err(|e| ReciteError::parse(format!("Unable to split '{}': {}", text, e), USAGE_PRINT))?;
    let Some(first) = tokens.first() else {
        return Ok(Command::Noop);
    };

    if tokens.len() == 1 {
        if let Some(command) = single_shorthand(first)? {
            return Ok(command);
        }
    } else if let Some(command) = multi_shorthand(text, &tokens)? {
        return Ok(command);
    }

    keyword(text, &tokens)
}

fn single_shorthand(token: &str) -> Result<Option<Command>> {
    if token.ends_with(".win") && Path::new(token).is_file() {
        return Ok(Some(Command::Batch(token.to_string())));
    }

    let command = if let Some(var) = token.strip_prefix('+') {
        Command::Count(var.to_string())
    } else if token.starts_with("//") {
        return Err(ReciteError::parse("Context requires a command to run", USAGE_CONTEXT));
    } else if let Some(rest) = token.strip_prefix('/') {
        find_shorthand(rest)?
    } else if let Some(target) = token.strip_prefix(">>") {
        Command::Gosub(target.to_string())
    } else if let Some(target) = token.strip_prefix('>') {
        Command::Goto(target.to_string())
    } else if let Some(fields) = token.strip_prefix("<<") {
        Command::Report {
            fields: fields.to_string(),
            filter: None,
        }
    } else if let Some(text) = token.strip_prefix('<') {
        Command::Print(text.to_string())
    } else if token == "$" {
        Command::Set(SetCommand::List)
    } else if token.starts_with('$') {
        set_shorthand(token)?
    } else if let Some(var) = token.strip_prefix('~') {
        if !var.starts_with('$') {
            return Err(ReciteError::parse(format!("Invalid unset '{}'", token), USAGE_UNSET));
        }
        Command::Unset(var.to_string())
    } else if token.starts_with('{') || token.starts_with('?') {
        return Err(ReciteError::parse(
            format!("'{}' needs a command to run", token),
            if token.starts_with('{') { USAGE_UNTIL } else { USAGE_IF },
        ));
    } else {
        return Ok(None);
    };

    Ok(Some(command))
}

fn find_shorthand(rest: &str) -> Result<Command> {
    let (all, rest) = match rest.strip_prefix('*') {
        Some(r) => (true, r),
        None => (false, rest),
    };

    if let Some(assign) = rest.strip_prefix('$') {
        let usage = if all { USAGE_FINDALL } else { USAGE_FIND };
        let (var, field) = assign
            .split_once('=')
            .filter(|(v, f)| !v.is_empty() && !f.is_empty())
            .ok_or_else(|| ReciteError::parse(format!("Invalid find '/{}'", rest), usage))?;
        let var = format!("${}", var);
        return Ok(if all {
            Command::Findall {
                field: field.to_string(),
                var,
            }
        } else {
            Command::Find {
                look: field.to_string(),
                var: Some(var),
                instance: None,
            }
        });
    }

    if all || rest.is_empty() {
        return Err(ReciteError::parse("Incorrect find syntax", USAGE_FINDALL));
    }

    Ok(Command::Find {
        look: rest.to_string(),
        var: None,
        instance: None,
    })
}

fn set_shorthand(token: &str) -> Result<Command> {
    let invalid = || ReciteError::parse(format!("Set syntax error in '{}'", token), USAGE_SET);
    let (lhs, value) = token.split_once('=').ok_or_else(invalid)?;
    let (name, eval) = match lhs.strip_suffix(':') {
        Some(name) => (name, true),
        None => (lhs, false),
    };
    if name.len() < 2 || value.is_empty() {
        return Err(invalid());
    }

    Ok(Command::Set(if eval {
        SetCommand::Eval {
            name: name.to_string(),
            expr: value.to_string(),
        }
    } else {
        SetCommand::Assign {
            name: name.to_string(),
            value: value.to_string(),
        }
    }))
}

fn multi_shorthand(text: &str, tokens: &[String]) -> Result<Option<Command>> {
    let first = tokens[0].as_str();
    let rest = || tail(text, tokens, 1);

    let command = if first.starts_with('$') {
        return Err(ReciteError::parse("Set syntax error, quote values with spaces", USAGE_SET));
    } else if let Some(cond) = first.strip_prefix('?') {
        Command::If {
            cond: cond.to_string(),
            then: Box::new(parse_command(&rest())?),
        }
    } else if let Some(fields) = first.strip_prefix("<<") {
        let filter = tokens[1]
            .strip_prefix("//")
            .filter(|f| f.contains('=') && tokens.len() == 2)
            .ok_or_else(|| ReciteError::parse("Report syntax error", USAGE_REPORT))?;
        Command::Report {
            fields: fields.to_string(),
            filter: Some(filter.to_string()),
        }
    } else if first.starts_with('<') {
        Command::Print(text[1..].to_string())
    } else if let Some(look) = first.strip_prefix("//") {
        Command::Context {
            look: look.to_string(),
            inner: Box::new(parse_command(&rest())?),
        }
    } else if let Some(cond) = first.strip_prefix('{') {
        Command::Until {
            cond: cond.to_string(),
            args: tokens[1..].to_vec(),
        }
    } else {
        return Ok(None);
    };

    Ok(Some(command))
}

fn expect_args(tokens: &[String], range: std::ops::RangeInclusive<usize>, usage: &'static str) -> Result<()> {
    let given = tokens.len() - 1;
    if range.contains(&given) {
        Ok(())
    } else {
        Err(ReciteError::parse(
            format!("{} takes {} arguments, {} given", tokens[0], describe(&range), given),
            usage,
        ))
    }
}

fn describe(range: &std::ops::RangeInclusive<usize>) -> String {
    match (range.start(), range.end()) {
        (a, b) if a == b => a.to_string(),
        (a, &usize::MAX) => format!("{} or more", a),
        (a, b) => format!("{} to {}", a, b),
    }
}

/// Text after the first `skip` tokens, as typed. Falls back to re-joining
/// the tokens when quoting makes the raw text ambiguous.
fn tail(text: &str, tokens: &[String], skip: usize) -> String {
    let mut rest = text.trim_start();
    for token in &tokens[..skip] {
        match rest.strip_prefix(token.as_str()) {
            Some(r) if r.starts_with(char::is_whitespace) => rest = r.trim_start(),
            _ => return shell_words::join(&tokens[skip..]),
        }
    }
    rest.to_string()
}

/// Text after the first word, as typed.
fn raw_rest(text: &str) -> Option<&str> {
    text.split_once(' ').map(|(_, rest)| rest)
}

fn keyword(text: &str, tokens: &[String]) -> Result<Command> {
    let arg = |i: usize| tokens[i].clone();
    let joined_from = |i: usize| tail(text, tokens, i);

    let command = match tokens[0].to_lowercase().as_str() {
        "quit" | "exit" => Command::Quit,
        "clear" => Command::Clear,
        "return" => Command::Return,
        "batch" => {
            expect_args(tokens, 1..=1, USAGE_BATCH)?;
            Command::Batch(arg(1))
        }
        "context" => {
            expect_args(tokens, 2..=usize::MAX, USAGE_CONTEXT)?;
            Command::Context {
                look: arg(1),
                inner: Box::new(parse_command(&joined_from(2))?),
            }
        }
        "count" => {
            expect_args(tokens, 1..=1, USAGE_COUNT)?;
            Command::Count(arg(1))
        }
        "find" => {
            expect_args(tokens, 1..=3, USAGE_FIND)?;
            Command::Find {
                look: arg(1),
                var: tokens.get(2).cloned(),
                instance: tokens.get(3).cloned(),
            }
        }
        "findall" => {
            expect_args(tokens, 2..=2, USAGE_FINDALL)?;
            Command::Findall {
                field: arg(1),
                var: arg(2),
            }
        }
        "gosub" => {
            expect_args(tokens, 1..=1, USAGE_GOTO)?;
            Command::Gosub(arg(1))
        }
        "goto" => {
            expect_args(tokens, 1..=1, USAGE_GOTO)?;
            Command::Goto(arg(1))
        }
        "if" => {
            expect_args(tokens, 2..=usize::MAX, USAGE_IF)?;
            Command::If {
                cond: arg(1),
                then: Box::new(parse_command(&joined_from(2))?),
            }
        }
        "log" => {
            expect_args(tokens, 0..=2, USAGE_LOG)?;
            Command::Log {
                path: tokens.get(1).cloned(),
                mode: tokens.get(2).cloned(),
            }
        }
        "print" => {
            let rest = raw_rest(text)
                .ok_or_else(|| ReciteError::parse("Print requires text", USAGE_PRINT))?;
            Command::Print(rest.to_string())
        }
        "report" => match tokens.len() {
            2 => Command::Report {
                fields: arg(1),
                filter: None,
            },
            4 if tokens[2].eq_ignore_ascii_case("where") && tokens[3].contains('=') => Command::Report {
                fields: arg(1),
                filter: Some(arg(3)),
            },
            _ => return Err(ReciteError::parse("Invalid syntax for report", USAGE_REPORT)),
        },
        "set" => set_keyword(text)?,
        "sleep" => {
            expect_args(tokens, 1..=1, USAGE_SLEEP)?;
            Command::Sleep(arg(1))
        }
        "unset" => {
            expect_args(tokens, 1..=1, USAGE_UNSET)?;
            Command::Unset(arg(1))
        }
        "until" => {
            expect_args(tokens, 2..=usize::MAX, USAGE_UNTIL)?;
            Command::Until {
                cond: arg(1),
                args: tokens[2..].to_vec(),
            }
        }
        _ => invoke(tokens)?,
    };

    Ok(command)
}

fn set_keyword(text: &str) -> Result<Command> {
    let Some(rest) = raw_rest(text).map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(Command::Set(SetCommand::List));
    };

    let (first, value) = rest
        .split_once(' ')
        .ok_or_else(|| ReciteError::parse("Set requires a name and a value", USAGE_SET))?;

    if first.eq_ignore_ascii_case("/a") {
        let (name, expr) = value
            .trim()
            .split_once(' ')
            .ok_or_else(|| ReciteError::parse("Set /a requires a name and an expression", USAGE_SET))?;
        return Ok(Command::Set(SetCommand::Eval {
            name: name.to_string(),
            expr: expr.trim().to_string(),
        }));
    }

    Ok(Command::Set(SetCommand::Assign {
        name: first.to_string(),
        value: unquote(value.trim()).to_string(),
    }))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn is_operator(token: &str) -> bool {
    token.starts_with(['+', '/', '>', '?', '<', '{'])
}

/// Split a method line into its call and trailing operators. `?cond` and
/// `//k=v` take the next operator as their inner command.
fn invoke(tokens: &[String]) -> Result<Command> {
    let (call, ops): (Vec<String>, Vec<String>) = tokens.iter().cloned().partition(|t| !is_operator(t));
    if call.is_empty() {
        return Err(ReciteError::parse("Missing method name", USAGE_PRINT));
    }

    let mut until = None;
    let mut commands = Vec::new();
    let mut ops = ops.into_iter().peekable();
    while let Some(op) = ops.next() {
        if let Some(cond) = op.strip_prefix('{') {
            if until.replace(cond.to_string()).is_some() {
                return Err(ReciteError::parse("Only one poll condition per call", USAGE_UNTIL));
            }
            continue;
        }
        commands.push(chain(op, &mut ops)?);
    }

    Ok(Command::Invoke {
        call,
        until,
        ops: commands,
    })
}

fn chain(op: String, rest: &mut std::iter::Peekable<std::vec::IntoIter<String>>) -> Result<Command> {
    let wraps = op.starts_with('?') || op.starts_with("//");
    if !wraps {
        return single_shorthand(&op)?
            .ok_or_else(|| ReciteError::parse(format!("Unknown operator '{}'", op), USAGE_PRINT));
    }

    let inner = match rest.next() {
        Some(next) => chain(next, rest)?,
        None => {
            return Err(ReciteError::parse(
                format!("'{}' needs a following operator", op),
                if op.starts_with('?') { USAGE_IF } else { USAGE_CONTEXT },
            ))
        }
    };

    Ok(match op.strip_prefix("//") {
        Some(look) => Command::Context {
            look: look.to_string(),
            inner: Box::new(inner),
        },
        None => Command::If {
            cond: op[1..].to_string(),
            then: Box::new(inner),
        },
    })
}
