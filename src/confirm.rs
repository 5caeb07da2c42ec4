//! Interactive safety gate before a destructive sync.
//!
//! The operator must type the name of the side being overwritten. Anything
//! else, including end of input, declines.

use anyhow::{Context, Result};
use std::io::{BufRead, Write};

use crate::record::Direction;

pub fn prompt_text(direction: Direction, dry_run: bool) -> String {
    let target = direction.target();
    if dry_run {
        format!(
            "Dry run {}: validation and export only, the {} database is not modified.\n\
             Type '{}' to continue: ",
            direction, target, target
        )
    } else {
        format!(
            "Sync {} will TRUNCATE and overwrite every registry table in the {} database.\n\
             Type '{}' to continue: ",
            direction, target, target
        )
    }
}

/// Ask on `output`, read one line from `input`.
pub fn confirm<R: BufRead, W: Write>(
    direction: Direction,
    dry_run: bool,
    input: &mut R,
    output: &mut W,
) -> Result<bool> {
    write!(output, "{}", prompt_text(direction, dry_run)).context("failed to write prompt")?;
    output.flush().context("failed to flush prompt")?;

    let mut answer = String::new();
    let read = input
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    if read == 0 {
        return Ok(false);
    }
    Ok(answer.trim().eq_ignore_ascii_case(direction.target().as_str()))
}

/// [`confirm`] against the process terminal.
pub fn confirm_stdin(direction: Direction, dry_run: bool) -> Result<bool> {
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut output = std::io::stderr();
    confirm(direction, dry_run, &mut input, &mut output)
}
