use std::io::Write;

use labterm_session::types::ConsoleInfo;
use tabwriter::TabWriter;

use crate::CliError;

/// Render a node's consoles as a table, or as a JSON array with `json`.
pub fn render(
    consoles: &[ConsoleInfo],
    json: bool,
    stdout: &mut dyn Write,
) -> Result<(), CliError> {
    if json {
        let body = serde_json::to_string_pretty(consoles)
            .map_err(|err| CliError::Output(err.to_string()))?;
        writeln!(stdout, "{body}")?;
        return Ok(());
    }

    if consoles.is_empty() {
        writeln!(stdout, "No consoles found")?;
        return Ok(());
    }

    let mut tw = TabWriter::new(&mut *stdout).padding(2);
    writeln!(tw, "ID\tTYPE\tPROTOCOL")?;
    for console in consoles {
        writeln!(
            tw,
            "{}\t{}\t{}",
            console.id,
            console.console_type.as_deref().unwrap_or("-"),
            console.protocol.as_deref().unwrap_or("-"),
        )?;
    }
    tw.flush()?;
    Ok(())
}
