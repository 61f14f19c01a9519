//! Output formatting for CLI

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// Plain text format
    Plain,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn table<T: TableDisplay>(rows: impl IntoIterator<Item = Vec<String>>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(T::headers());
    for row in rows {
        table.add_row(row);
    }
    table
}

fn plain<T: TableDisplay>(item: &T) -> String {
    T::headers()
        .iter()
        .zip(item.row())
        .map(|(header, value)| format!("{}: {}", header, value))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a single item
pub fn render_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) -> String {
    match format {
        OutputFormat::Table => table::<T>([item.row()]).to_string(),
        OutputFormat::Json => serde_json::to_string_pretty(item).unwrap_or_default(),
        OutputFormat::Plain => plain(item),
    }
}

/// Render a list of items
pub fn render_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(items).unwrap_or_default(),
        _ if items.is_empty() => "No items found.".to_string(),
        OutputFormat::Table => table::<T>(items.iter().map(TableDisplay::row)).to_string(),
        OutputFormat::Plain => items.iter().map(plain).collect::<Vec<_>>().join("\n---\n"),
    }
}

/// Print a single item
pub fn print_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) {
    println!("{}", render_item(item, format));
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    println!("{}", render_list(items, format));
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("ℹ️  {}", message);
}
