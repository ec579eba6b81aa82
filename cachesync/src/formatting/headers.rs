use owo_colors::OwoColorize;

#[derive(Debug, Clone, Copy)]
pub enum SectionStyle {
    /// Phase titles.
    Primary,
    /// The command being run.
    Secondary,
}

/// Prints a section header followed by a blank line.
pub fn print_section_header(title: &str, style: SectionStyle) {
    match style {
        SectionStyle::Primary => println!("{}", title.cyan().bold()),
        SectionStyle::Secondary => println!("{} {}", "$".bright_black(), title.bright_black().bold()),
    }
    println!();
}
