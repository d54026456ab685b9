//! CLI output formatting utilities.

use crate::events::ContextMetadata;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

/// Output helper for CLI formatting.
pub struct Output;

impl Output {
    /// Print an info message.
    pub fn info(msg: &str) {
        println!("{} {}", style(">>").cyan().bold(), msg);
    }

    /// Print a success message.
    pub fn success(msg: &str) {
        println!("{} {}", style(">>").green().bold(), msg);
    }

    /// Print a warning message.
    pub fn warning(msg: &str) {
        eprintln!("{} {}", style(">>").yellow().bold(), msg);
    }

    /// Print an error message.
    pub fn error(msg: &str) {
        eprintln!("{} {}", style(">>").red().bold(), msg);
    }

    /// Print a header.
    pub fn header(msg: &str) {
        println!("\n{}", style(msg).bold().underlined());
    }

    /// Print a key-value pair.
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", style(key).dim(), value);
    }

    /// Print one cited source.
    pub fn source(context: &ContextMetadata) {
        println!("  {}", source_line(context));
    }

    /// Create a spinner.
    pub fn spinner(msg: &str) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap(),
        );
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        pb
    }
}

fn source_line(context: &ContextMetadata) -> String {
    let mut line = format!("[{}] {}", context.index, style(&context.readable_filename).bold());
    if let Some(page) = context.pagenumber {
        line.push_str(&format!(", p. {}", page));
    }
    if let Some(url) = &context.url {
        line.push_str(&format!(" {}", style(url).dim()));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_line_includes_page_and_url() {
        console::set_colors_enabled(false);
        let context = ContextMetadata {
            index: 2,
            readable_filename: "lecture3.pdf".to_string(),
            pagenumber: Some(7),
            url: Some("https://files.example.edu/lecture3.pdf".to_string()),
        };
        assert_eq!(
            source_line(&context),
            "[2] lecture3.pdf, p. 7 https://files.example.edu/lecture3.pdf"
        );
    }
}
