//! Key-value lines, summary boxes and unit formatting.

use std::time::Duration;

use owo_colors::OwoColorize;

const BOX_WIDTH: usize = 60;

/// Prints `items` as aligned rows inside a titled box.
pub fn print_summary_box(title: &str, items: &[(&str, &str)]) {
    let width = items.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let rule = "─".repeat(BOX_WIDTH.saturating_sub(title.len() + 4));

    println!("┌─ {} {}", title.cyan().bold(), rule.bright_black());
    for (key, value) in items {
        println!(
            "│ {} {}",
            format!("{:<width$}", key, width = width).bright_black().bold(),
            value.bold().white()
        );
    }
    println!("└{}", "─".repeat(BOX_WIDTH).bright_black());
}

pub fn print_key_value(key: &str, value: &str) {
    println!("  {} {}", key.bright_black().bold(), value.bold().white());
}

/// Formats an elapsed time as `250ms`, `4.20s` or `1m 30.0s`.
pub fn format_duration(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs_f64();
    match elapsed.as_secs() {
        0 => format!("{}ms", elapsed.as_millis()),
        1..=59 => format!("{:.2}s", seconds),
        secs => format!("{}m {:.1}s", secs / 60, seconds % 60.0),
    }
}

/// Formats a byte count with a binary unit.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
