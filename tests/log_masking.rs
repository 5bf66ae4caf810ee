use std::io;
use std::path::Path;
use std::sync::{Mutex, Once};

use log::{LevelFilter, Log, Metadata, Record};

use recite::catalog::Catalog;
use recite::cli::Plan;
use recite::config::Config;
use recite::error::Result;
use recite::hosts;
use recite::interpreter::Interpreter;
use recite::transport::{CommandResult, Invocation, Transport};

/// Keeps every formatted record for the whole test binary.
struct Recorder {
    lines: Mutex<Vec<String>>,
}

impl Log for Recorder {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(format!("{} {}", record.level(), record.args()));
        }
    }

    fn flush(&self) {}
}

static RECORDER: Recorder = Recorder {
    lines: Mutex::new(Vec::new()),
};

fn records() -> Vec<String> {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        log::set_logger(&RECORDER).unwrap();
        log::set_max_level(LevelFilter::Trace);
    });
    RECORDER.lines.lock().unwrap().clone()
}

struct Silent;

impl Transport for Silent {
    fn execute(&mut self, _: &Invocation) -> Result<CommandResult> {
        Ok(CommandResult {
            output: String::new(),
            exit_status: 0,
        })
    }
}

fn session() -> Interpreter {
    let catalog_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("catalog");
    let catalog = Catalog::build(&catalog_dir).unwrap();
    let mut interp = Interpreter::new(&Config::default(), catalog, Box::new(Silent))
        .with_output(Box::new(io::sink()));
    interp.vars_mut().set("$VERBOSE", "0").unwrap();
    interp.vars_mut().set("$IP", "root:Sup3rSecret@192.168.0.120").unwrap();
    interp
}

#[test]
fn passwords_stay_out_of_log_records() {
    records();
    let mut interp = session();
    interp.vars_mut().set("$PASS", "s3cr3tPW").unwrap();

    interp.execute_line("GetRAIDControllers $PASS");
    interp.execute_line("Set $IP root:hunter2pw@bad host!");
    assert!(hosts::expand_hosts(&["root:pw9x@bad host!"]).is_empty());
    let plan = Plan::parse(&["IP=root:pw8x@bad host!".to_string()], None, true);
    assert!(plan.hosts.is_empty());

    let lines = records();
    for secret in ["s3cr3tPW", "Sup3rSecret", "hunter2pw", "pw9x", "pw8x"] {
        assert!(
            lines.iter().all(|line| !line.contains(secret)),
            "{} logged in {:?}",
            secret,
            lines
        );
    }
    assert!(lines
        .iter()
        .any(|line| line.contains("Skipping '******' not in name=value format")));
    assert!(lines
        .iter()
        .any(|line| line.contains("Skipping malformed IP string in root:******@bad host!")));
    assert!(lines
        .iter()
        .any(|line| line.contains("No usable host in IP=root:******@bad host!")));
}
