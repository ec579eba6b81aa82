//! Table formatting utilities using comfy-table.

use cachesync_core::remote_cache::ExportReport;
use comfy_table::{Cell, Color, Table};

use super::Status;

/// Prints one row per exported key with its outcome.
pub fn print_export_table(report: &ExportReport) {
    let mut table = Table::new();
    table
        .set_header(vec![
            Cell::new("Cache").add_attribute(comfy_table::Attribute::Bold),
            Cell::new("Outcome").add_attribute(comfy_table::Attribute::Bold),
        ])
        .load_preset(comfy_table::presets::UTF8_FULL)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS)
        .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);

    for (key, outcome) in report.entries() {
        let status = Status::from(outcome);
        table.add_row(vec![
            Cell::new(key).fg(Color::White),
            Cell::new(status.format(&outcome.to_string())),
        ]);
    }

    println!("{}", table);
}
