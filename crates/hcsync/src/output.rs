//! Output formatting: table, JSON, plain.
//!
//! Renders data in the format selected by `--output`. Table uses `tabled`,
//! structured formats use serde, plain emits one identifier per line.

use std::io::{self, IsTerminal, Write};

use owo_colors::OwoColorize;
use tabled::{Table, Tabled, settings::Style};

use hcsync_core::{Appliance, AuthPrompt};

use crate::cli::{ColorMode, OutputFormat};
use crate::error::CliError;

// ── Color helpers ────────────────────────────────────────────────────

pub fn should_color(mode: ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none(),
    }
}

// ── Render dispatchers ───────────────────────────────────────────────

/// Render a list in the chosen format.
pub fn render_list<T, R>(
    format: OutputFormat,
    data: &[T],
    to_row: impl Fn(&T) -> R,
    id_fn: impl Fn(&T) -> String,
) -> Result<String, CliError>
where
    T: serde::Serialize,
    R: Tabled,
{
    match format {
        OutputFormat::Table => {
            let rows: Vec<R> = data.iter().map(to_row).collect();
            Ok(Table::new(rows).with(Style::rounded()).to_string())
        }
        OutputFormat::Json => render_json(data, false),
        OutputFormat::JsonCompact => render_json(data, true),
        OutputFormat::Plain => Ok(data.iter().map(id_fn).collect::<Vec<_>>().join("\n")),
    }
}

pub fn render_json<T: serde::Serialize + ?Sized>(
    data: &T,
    compact: bool,
) -> Result<String, CliError> {
    let rendered = if compact {
        serde_json::to_string(data)
    } else {
        serde_json::to_string_pretty(data)
    };
    rendered.map_err(|e| CliError::Other(format!("failed to serialize output: {e}")))
}

/// Print to stdout, respecting quiet mode.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

/// Progress chatter goes to stderr so stdout stays machine-readable.
pub fn note(message: &str, quiet: bool) {
    if !quiet {
        eprintln!("{message}");
    }
}

// ── Device table ─────────────────────────────────────────────────────

#[derive(Tabled)]
pub struct ApplianceRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Type")]
    pub kind: String,
    #[tabled(rename = "Online")]
    pub connected: &'static str,
    #[tabled(rename = "Power")]
    pub power: String,
    #[tabled(rename = "Door")]
    pub door: String,
    #[tabled(rename = "Program")]
    pub program: String,
    #[tabled(rename = "Remaining")]
    pub remaining: String,
    #[tabled(rename = "Progress")]
    pub progress: String,
}

impl From<&Appliance> for ApplianceRow {
    fn from(a: &Appliance) -> Self {
        Self {
            id: a.id.clone(),
            name: a.name.clone(),
            kind: a.kind.clone(),
            connected: if a.connected { "yes" } else { "no" },
            power: a.power_state.to_string(),
            door: a.door_state.to_string(),
            program: a
                .active_program
                .as_ref()
                .map_or_else(|| "-".into(), |p| p.label().to_owned()),
            remaining: a
                .remaining_program_seconds
                .map_or_else(|| "-".into(), format_remaining),
            progress: a
                .estimated_progress_percent()
                .map_or_else(|| "-".into(), |p| format!("{p}%")),
        }
    }
}

fn format_remaining(secs: u64) -> String {
    let (h, m) = (secs / 3600, (secs % 3600) / 60);
    if h > 0 {
        format!("{h}h {m:02}m")
    } else {
        format!("{m}m {:02}s", secs % 60)
    }
}

/// Plain-text device-flow instructions.
pub fn format_auth_prompt(prompt: &AuthPrompt, color: bool) -> String {
    let uri = prompt
        .verification_uri_complete
        .as_deref()
        .unwrap_or(&prompt.verification_uri);
    let minutes = prompt.expires_in_secs / 60;
    if color {
        format!(
            "To authorize hcsync, open {} and enter code {} (valid {minutes} min)",
            uri.cyan().underline(),
            prompt.user_code.bold().yellow(),
        )
    } else {
        format!(
            "To authorize hcsync, open {uri} and enter code {} (valid {minutes} min)",
            prompt.user_code
        )
    }
}
