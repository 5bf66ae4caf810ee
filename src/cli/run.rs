use std::io::{self, BufRead, Write};

use anyhow::Result;

use crate::catalog::Catalog;
use crate::cli::Plan;
use crate::config::{Config, VERBOSE_WSMAN};
use crate::hosts;
use crate::interpreter::Interpreter;
use crate::transport::WsmanTransport;
use crate::utils::MASK;

/// Run one session against the current host. Returns whether every
/// command and script succeeded.
pub fn run_session(config: &Config, catalog: Catalog, plan: &Plan) -> Result<bool> {
    let mut interp = Interpreter::new(config, catalog, Box::new(WsmanTransport));
    apply_presets(&mut interp, &plan.presets);

    let mut ok = true;
    for command in &plan.commands {
        ok = interp.execute_line(command) && ok;
        if interp.is_quit() {
            return Ok(ok);
        }
    }

    if plan.interactive() {
        interactive(&mut interp)?;
        return Ok(ok);
    }

    for script in &plan.scripts {
        if !interp.run_script(script) {
            return Ok(false);
        }
        if interp.is_quit() {
            break;
        }
    }

    Ok(ok)
}

fn apply_presets(interp: &mut Interpreter, presets: &[(String, String)]) {
    for (name, value) in presets {
        let var = format!("${}", name);
        if interp.vars().verbose() > VERBOSE_WSMAN {
            let shown = if name == "PASS" { MASK.to_string() } else { hosts::mask_credentials(value) };
            println!("Set {} {}", var, shown);
        }
        if let Err(e) = interp.vars_mut().set(&var, value) {
            log::warn!("Skipping argument {}: {}", name, e);
        }
    }
}

/// Read lines from stdin at the `--> ` prompt until end of input or `Quit`.
pub fn interactive(interp: &mut Interpreter) -> Result<()> {
    let stdin = io::stdin();
    let mut line = String::new();

    loop {
        print!("--> ");
        io::stdout().flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            println!();
            break;
        }

        interp.execute_line(line.trim_end_matches(['\r', '\n']));
        if interp.is_quit() {
            break;
        }
    }

    Ok(())
}
