use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One message as printed by `serve` and `send --wait`.
#[derive(Debug, Serialize)]
pub struct MessageOutput<'a> {
    pub pipe: &'a str,
    pub connection_id: u64,
    pub message: &'a Value,
    pub timestamp: String,
}

impl<'a> MessageOutput<'a> {
    pub fn new(pipe: &'a str, connection_id: u64, message: &'a Value) -> Self {
        Self {
            pipe,
            connection_id,
            message,
            timestamp: now_unix_seconds(),
        }
    }
}

pub fn print_message(out: &MessageOutput<'_>, format: OutputFormat) {
    println!("{}", render_message(out, format));
}

pub fn render_message(out: &MessageOutput<'_>, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["PIPE", "CONNECTION", "MESSAGE"])
                .add_row(vec![
                    out.pipe.to_string(),
                    out.connection_id.to_string(),
                    out.message.to_string(),
                ]);
            table.to_string()
        }
        OutputFormat::Pretty => {
            let body = serde_json::to_string_pretty(out.message)
                .unwrap_or_else(|_| out.message.to_string());
            format!("[{} #{}] {}", out.pipe, out.connection_id, body)
        }
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_output_is_one_line_with_message() {
        let message = serde_json::json!({ "fan": 1, "percent": 60 });
        let out = MessageOutput::new("fanctl_3", 3, &message);
        let line = render_message(&out, OutputFormat::Json);
        assert!(!line.contains('\n'));

        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["pipe"], "fanctl_3");
        assert_eq!(parsed["connection_id"], 3);
        assert_eq!(parsed["message"]["percent"], 60);
    }

    #[test]
    fn table_and_pretty_mention_pipe() {
        let message = serde_json::json!("ping");
        let out = MessageOutput::new("fanctl_1", 1, &message);
        assert!(render_message(&out, OutputFormat::Table).contains("fanctl_1"));
        assert!(render_message(&out, OutputFormat::Pretty).starts_with("[fanctl_1 #1]"));
    }
}
