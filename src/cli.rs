/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! CLI utilities for terminal output formatting and colors.

use crossterm::tty::IsTty;
use std::fmt::Write as _;
use std::io::stdout;

use crate::mcp::{ToolContent, ToolDescriptor, ToolResult};

/// Configuration for color output
#[derive(Debug, Clone)]
pub struct ColorConfig {
    /// Whether ANSI escapes are emitted.
    pub enabled: bool,
}

impl ColorConfig {
    /// Create a new `ColorConfig`, auto-detecting TTY unless nocolor is true
    #[must_use]
    pub fn new(nocolor: bool) -> Self {
        Self {
            enabled: !nocolor && stdout().is_tty(),
        }
    }

    fn paint(&self, code: &str, s: &str) -> String {
        if self.enabled {
            format!("\x1b[{code}m{s}\x1b[0m")
        } else {
            s.to_string()
        }
    }

    /// Green (tool names)
    #[must_use]
    pub fn green(&self, s: &str) -> String {
        self.paint("32", s)
    }

    /// Red (errors)
    #[must_use]
    pub fn red(&self, s: &str) -> String {
        self.paint("31", s)
    }

    /// Cyan (server names)
    #[must_use]
    pub fn cyan(&self, s: &str) -> String {
        self.paint("36", s)
    }

    /// Dim text
    #[must_use]
    pub fn dim(&self, s: &str) -> String {
        self.paint("2", s)
    }

    /// Bold text
    #[must_use]
    pub fn bold(&self, s: &str) -> String {
        self.paint("1", s)
    }
}

/// Get the terminal width, defaulting to 80 if unable to detect
#[must_use]
pub fn terminal_width() -> usize {
    crossterm::terminal::size().map_or(80, |(w, _)| usize::from(w))
}

/// Truncate a string to `max_len` characters, adding "..." if truncated
#[must_use]
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        ".".repeat(max_len)
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{kept}...")
    }
}

/// Column width configuration for the tools command
#[derive(Debug)]
pub struct ColumnWidths {
    /// NAME column.
    pub name: usize,
    /// DESCRIPTION column.
    pub description: usize,
}

impl ColumnWidths {
    /// Calculate column widths based on terminal width and the longest name
    /// Columns: NAME | DESCRIPTION
    #[must_use]
    pub fn calculate(term_width: usize, longest_name: usize) -> Self {
        let min_name = 8;
        let max_name = 40;
        let min_description = 20;

        let name = longest_name.clamp(min_name, max_name);
        // Two-space gap between columns
        let description = term_width.saturating_sub(name + 2).max(min_description);

        Self { name, description }
    }
}

/// Renders the tool listing as a two-column table.
#[must_use]
pub fn render_tool_table(tools: &[ToolDescriptor], colors: &ColorConfig, term_width: usize) -> String {
    let longest = tools.iter().map(|t| t.name.chars().count()).max().unwrap_or(0);
    let widths = ColumnWidths::calculate(term_width, longest);

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}",
        colors.bold(&format!("{:<name$}  DESCRIPTION", "NAME", name = widths.name))
    );

    for tool in tools {
        let name = truncate(&tool.name, widths.name);
        // Descriptions are often multi-line; the first line is the summary.
        let summary = tool
            .description
            .as_deref()
            .and_then(|d| d.lines().find(|l| !l.trim().is_empty()))
            .unwrap_or("")
            .trim();
        let padding = widths.name.saturating_sub(name.chars().count());
        let _ = writeln!(
            out,
            "{}{}  {}",
            colors.green(&name),
            " ".repeat(padding),
            colors.dim(&truncate(summary, widths.description))
        );
    }

    let _ = write!(out, "{} tool(s)", tools.len());
    out
}

/// Renders a tool result for the terminal.
///
/// Text items are printed as-is; anything else is shown as compact JSON.
#[must_use]
pub fn render_tool_result(result: &ToolResult) -> String {
    result
        .content
        .iter()
        .map(|item| match item {
            ToolContent::Text(text) => text.clone(),
            ToolContent::Opaque(value) => value.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, description: Option<&str>) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: description.map(ToString::to_string),
            input_schema: json!({}),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_truncate_short_string() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("test", 4), "test");
    }

    #[test]
    fn test_truncate_long_string() {
        assert_eq!(truncate("hello world", 8), "hello...");
        assert_eq!(truncate("abcdefghij", 7), "abcd...");
    }

    #[test]
    fn test_truncate_edge_cases() {
        assert_eq!(truncate("hello", 3), "...");
        assert_eq!(truncate("hello", 2), "..");
        assert_eq!(truncate("hello", 1), ".");
        assert_eq!(truncate("hello", 0), "");
    }

    #[test]
    fn test_truncate_narrow_width_keeps_fitting_text() {
        assert_eq!(truncate("ab", 3), "ab");
        assert_eq!(truncate("abc", 3), "abc");
        assert_eq!(truncate("", 0), "");
        assert_eq!(truncate("abcd", 3), "...");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate("überprüfung", 6), "übe...");
        assert_eq!(truncate("日本語", 4), "日本語");
    }

    #[test]
    fn test_color_config_disabled() {
        let config = ColorConfig::new(true);
        assert!(!config.enabled);
        assert_eq!(config.green("test"), "test");
        assert_eq!(config.red("test"), "test");
        assert_eq!(config.cyan("test"), "test");
        assert_eq!(config.bold("test"), "test");
    }

    #[test]
    fn test_color_config_enabled() {
        let config = ColorConfig { enabled: true };
        assert_eq!(config.red("x"), "\x1b[31mx\x1b[0m");
    }

    #[test]
    fn test_calculate_column_widths() {
        let widths = ColumnWidths::calculate(120, 18);
        assert_eq!(widths.name, 18);
        assert_eq!(widths.description, 100);

        let widths = ColumnWidths::calculate(120, 90);
        assert_eq!(widths.name, 40);
    }

    #[test]
    fn test_calculate_column_widths_shrinks() {
        let widths = ColumnWidths::calculate(30, 4);
        assert_eq!(widths.name, 8);
        assert_eq!(widths.description, 20);
    }

    #[test]
    fn test_render_tool_table() {
        let colors = ColorConfig { enabled: false };
        let tools = vec![
            tool("search_nodes", Some("\nSearch n8n nodes by keyword.\nMore detail.")),
            tool("health", None),
        ];

        let table = render_tool_table(&tools, &colors, 80);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("NAME"));
        assert_eq!(lines[1], "search_nodes  Search n8n nodes by keyword.");
        assert_eq!(lines[2].trim_end(), "health");
        assert_eq!(lines[3], "2 tool(s)");
    }

    #[test]
    fn test_render_tool_result() {
        let result = ToolResult {
            content: vec![
                ToolContent::Text("hi".to_string()),
                ToolContent::Opaque(json!({ "type": "image", "data": "aGk=" })),
            ],
            ..ToolResult::default()
        };
        let rendered = render_tool_result(&result);
        assert!(rendered.starts_with("hi\n"));
        assert!(rendered.contains("\"type\":\"image\""));
    }
}
