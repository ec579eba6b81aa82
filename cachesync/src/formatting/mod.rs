//! Terminal output for the CLI.
//!
//! Every command prints through these helpers so that symbols, colors and
//! table layout stay consistent.

mod headers;
mod output;
mod progress;
mod status;
mod tables;

pub use headers::{print_section_header, SectionStyle};
pub use output::{format_bytes, format_duration, print_key_value, print_summary_box};
pub use progress::create_spinner;
pub use status::{print_success, print_warning, Status};
pub use tables::print_export_table;
