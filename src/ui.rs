//! Terminal output.
//!
//! Status lines are printed with a leading glyph and a color per severity:
//!
//! - `info` - progress of the current phase
//! - `success` - a phase or step finished
//! - `warning` - something was skipped or degraded, the run continues
//! - `error` / `fatal` - the run cannot continue
//!
//! `Table` renders the end-of-run summary.

use colored::*;
use std::cmp;

pub fn info(message: impl AsRef<str>) {
    println!("{} {}", "ℹ".blue(), message.as_ref().bright_blue());
}

pub fn success(message: impl AsRef<str>) {
    println!("{} {}", "✓".green(), message.as_ref().bright_green());
}

pub fn warning(message: impl AsRef<str>) {
    println!("{} {}", "!".yellow(), message.as_ref().bright_yellow());
}

pub fn error(message: impl AsRef<str>) {
    eprintln!("{} {}", "x".red(), message.as_ref().red());
}

/// Blank line between phases.
pub fn gap() {
    println!();
}

/// Prints an unrecoverable error with its cause chain.
///
/// The backtrace is only present when `RUST_BACKTRACE` is set.
pub fn fatal(err: &anyhow::Error) {
    eprintln!();
    eprintln!("{}", format!("ERROR: {}", err).red().bold());
    for cause in err.chain().skip(1) {
        eprintln!("  {} {}", "Caused by:".red(), cause);
    }
    let backtrace = err.backtrace();
    if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        eprintln!("{}", "Stack trace for error:".dimmed());
        eprintln!("{}", backtrace);
    }
}

pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|s| s.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn add_row(&mut self, row: Vec<String>) {
        if row.len() == self.headers.len() {
            self.rows.push(row);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column_widths(&self, max_width: usize) -> Vec<usize> {
        let mut widths: Vec<usize> = self
            .headers
            .iter()
            .map(|h| console::measure_text_width(h))
            .collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = cmp::max(widths[i], console::measure_text_width(cell));
            }
        }

        // Shrink the widest column until the table fits, never below 8
        let overhead = 2 + 3 * widths.len() + 1;
        let available = max_width.saturating_sub(overhead);
        while widths.iter().sum::<usize>() > available {
            let Some((idx, &widest)) = widths.iter().enumerate().max_by_key(|(_, w)| **w) else {
                break;
            };
            if widest <= 8 {
                break;
            }
            widths[idx] -= 1;
        }
        widths
    }

    pub fn render(&self, max_width: usize) -> String {
        if self.headers.is_empty() {
            return String::new();
        }
        let widths = self.column_widths(max_width);

        let separator = |left: &str, mid: &str, right: &str| -> String {
            let cells: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
            format!("  {}{}{}", left, cells.join(mid), right)
        };
        let line = |cells: &[String], bold: bool| -> String {
            let mut out = String::from("  │");
            for (cell, width) in cells.iter().zip(&widths) {
                let text = console::truncate_str(cell, *width, "...");
                let padding = width.saturating_sub(console::measure_text_width(&text));
                let text = if bold {
                    text.bold().to_string()
                } else {
                    text.to_string()
                };
                out.push_str(&format!(" {}{} │", text, " ".repeat(padding)));
            }
            out
        };

        let mut out = Vec::with_capacity(self.rows.len() + 4);
        out.push(separator("┌", "┬", "┐"));
        out.push(line(&self.headers, true));
        out.push(separator("├", "┼", "┤"));
        for row in &self.rows {
            out.push(line(row, false));
        }
        out.push(separator("└", "┴", "┘"));
        out.join("\n")
    }

    pub fn print(&self) {
        let (_, term_width) = console::Term::stdout().size();
        println!("{}", self.render(term_width as usize));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ignores_rows_with_wrong_arity() {
        let mut table = Table::new(&["Library", "Handled as"]);
        table.add_row(vec!["zlib".to_string()]);
        assert!(table.is_empty());
        table.add_row(vec!["zlib".to_string(), "source".to_string()]);
        assert!(!table.is_empty());
    }

    #[test]
    fn test_table_render_contains_cells() {
        colored::control::set_override(false);
        let mut table = Table::new(&["Library", "Handled as"]);
        table.add_row(vec!["AngelScript".to_string(), "precompiled".to_string()]);
        let rendered = table.render(120);
        assert!(rendered.contains("AngelScript"));
        assert!(rendered.contains("precompiled"));
        assert_eq!(rendered.lines().count(), 5);
    }

    #[test]
    fn test_table_shrinks_to_width() {
        colored::control::set_override(false);
        let mut table = Table::new(&["Library", "Note"]);
        table.add_row(vec!["a".repeat(60), "b".repeat(60)]);
        let rendered = table.render(60);
        for line in rendered.lines() {
            assert!(console::measure_text_width(line) <= 60, "too wide: {line}");
        }
    }
}
