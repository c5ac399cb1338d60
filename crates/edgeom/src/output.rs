//! Output formatting: table or JSON.

use std::io::{self, IsTerminal, Write};

use owo_colors::OwoColorize;
use tabled::{Table, Tabled, settings::Style};

use crate::cli::OutputFormat;

pub fn should_color() -> bool {
    io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err()
}

/// Render rows as a table, or the original data as pretty JSON.
pub fn render_list<T, R>(
    format: OutputFormat,
    data: &[T],
    to_row: impl Fn(&T) -> R,
) -> Result<String, serde_json::Error>
where
    T: serde::Serialize,
    R: Tabled,
{
    match format {
        OutputFormat::Table => {
            let rows: Vec<R> = data.iter().map(to_row).collect();
            Ok(render_table(&rows))
        }
        OutputFormat::Json => serde_json::to_string_pretty(data),
    }
}

/// Render one item: `detail` for tables, pretty JSON otherwise.
pub fn render_single<T: serde::Serialize>(
    format: OutputFormat,
    data: &T,
    detail: impl Fn(&T) -> String,
) -> Result<String, serde_json::Error> {
    match format {
        OutputFormat::Table => Ok(detail(data)),
        OutputFormat::Json => serde_json::to_string_pretty(data),
    }
}

fn render_table<R: Tabled>(rows: &[R]) -> String {
    if rows.is_empty() {
        return "(none)".into();
    }
    Table::new(rows).with(Style::rounded()).to_string()
}

/// Highlight a status word when writing to a terminal.
pub fn paint_status(status: &str) -> String {
    if !should_color() {
        return status.to_owned();
    }
    match status {
        "ready" => status.green().to_string(),
        "connected" | "connecting" => status.yellow().to_string(),
        "err_configured" => status.red().to_string(),
        _ => status.dimmed().to_string(),
    }
}

pub fn print_output(output: &str) {
    if output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}
