//! Interactive conflict prompt for `tether sync --interactive`.

use std::cell::RefCell;
use std::io::{self, BufRead, Write};
use tether_core::sync::{ConflictPrompt, FieldConflict, PromptChoice, RecordKey};

/// Asks on `output` and reads one answer per line from `input`.
///
/// End of input answers `skip` for every remaining conflict.
pub struct LinePrompt<R, W> {
    input: RefCell<R>,
    output: RefCell<W>,
}

impl<R: BufRead, W: Write> LinePrompt<R, W> {
    pub const fn new(input: R, output: W) -> Self {
        Self {
            input: RefCell::new(input),
            output: RefCell::new(output),
        }
    }

    fn ask(&self, key: &RecordKey, conflict: &FieldConflict) -> io::Result<PromptChoice> {
        let mut out = self.output.borrow_mut();
        writeln!(out, "conflict in {key} ({})", conflict.group)?;
        if let Some(base) = &conflict.baseline {
            writeln!(out, "  base:   {base}")?;
        }
        writeln!(out, "  local:  {}", conflict.local)?;
        writeln!(out, "  remote: {}", conflict.remote)?;
        loop {
            write!(out, "keep [l]ocal, [r]emote or [s]kip? ")?;
            out.flush()?;
            let mut line = String::new();
            if self.input.borrow_mut().read_line(&mut line)? == 0 {
                writeln!(out)?;
                return Ok(PromptChoice::Skip);
            }
            if let Some(choice) = parse_choice(&line) {
                return Ok(choice);
            }
        }
    }
}

impl<R: BufRead, W: Write> ConflictPrompt for LinePrompt<R, W> {
    fn choose(&self, key: &RecordKey, conflict: &FieldConflict) -> PromptChoice {
        self.ask(key, conflict).unwrap_or_else(|err| {
            tracing::warn!(%key, error = %err, "conflict prompt failed; skipping");
            PromptChoice::Skip
        })
    }
}

fn parse_choice(line: &str) -> Option<PromptChoice> {
    match line.trim().to_ascii_lowercase().as_str() {
        "l" | "local" => Some(PromptChoice::Local),
        "r" | "remote" => Some(PromptChoice::Remote),
        "s" | "skip" | "" => Some(PromptChoice::Skip),
        _ => None,
    }
}
