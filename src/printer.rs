//! Printer spool service.
//!
//! Each configured printer exports a spool tree: clients drop jobs into
//! `RemSpool`, the server moves them to `RemQueue`, runs the configured
//! print command with `%f` substituted, and removes the job. Poll deadlines
//! are per-printer state owned by the main loop.

use crate::config::{Config, PrinterConfig};
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

struct PrinterState {
    printer: PrinterConfig,
    next_poll: Instant,
}

/// All printers plus their polling deadlines.
pub struct PrinterPool {
    printers: Vec<PrinterState>,
}

impl PrinterPool {
    pub fn new(config: &Config) -> Self {
        let now = Instant::now();
        Self {
            printers: config
                .printers
                .iter()
                .map(|p| PrinterState {
                    printer: p.clone(),
                    next_poll: now,
                })
                .collect(),
        }
    }

    /// Prepares every printer's spool tree and copies its definition file in.
    pub fn setup(config: &Config) {
        for printer in &config.printers {
            if let Err(e) = fs::create_dir_all(&printer.path) {
                error!(printer = %printer.name, error = %e, "cannot create spool root");
                continue;
            }
            for sub in ["RemSpool", "RemQueue"] {
                if let Err(e) = fs::create_dir_all(printer.path.join(sub)) {
                    error!(printer = %printer.name, dir = sub, error = %e, "cannot create spool dir");
                }
            }
            let defn = printer.path.join(format!("{}.fc6", printer.name));
            if let Err(e) = fs::copy(&printer.definition, &defn) {
                error!(printer = %printer.name, error = %e, "cannot copy printer definition");
            }
        }
    }

    /// Runs any printer whose deadline has passed, then re-arms it.
    pub fn poll(&mut self) {
        let now = Instant::now();
        for state in &mut self.printers {
            if now < state.next_poll {
                continue;
            }
            process_spool(&state.printer);
            let interval = state.printer.poll_interval.max(1);
            state.next_poll = now + Duration::from_secs(interval);
        }
    }
}

/// Moves spooled jobs to the queue, prints them, and cleans up.
fn process_spool(printer: &PrinterConfig) {
    let spool = printer.path.join("RemSpool");
    let entries = match fs::read_dir(&spool) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let queued = printer.path.join("RemQueue").join(&name);
        if let Err(e) = fs::rename(entry.path(), &queued) {
            warn!(printer = %printer.name, job = %name.to_string_lossy(), error = %e, "cannot queue job");
            continue;
        }
        run_print_command(printer, &queued);
        if let Err(e) = fs::remove_file(&queued) {
            warn!(printer = %printer.name, error = %e, "cannot remove printed job");
        }
    }
}

fn run_print_command(printer: &PrinterConfig, job: &PathBuf) {
    let cmd = printer.command.replace("%f", &job.to_string_lossy());
    debug!(printer = %printer.name, command = %cmd, "printing job");
    match Command::new("sh").arg("-c").arg(&cmd).status() {
        Ok(status) if status.success() => {}
        Ok(status) => {
            error!(printer = %printer.name, code = ?status.code(), "print command failed")
        }
        Err(e) => error!(printer = %printer.name, error = %e, "cannot run print command"),
    }
}
