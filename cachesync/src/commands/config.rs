use anyhow::Result;

use crate::formatting::{print_key_value, print_section_header, SectionStyle};

use super::Context;

/// Prints the effective configuration, after environment overrides.
pub fn cmd_config(ctx: &Context) -> Result<()> {
    print_section_header("Configuration", SectionStyle::Primary);
    let source = match &ctx.config_path {
        Some(path) if path.exists() => path.display().to_string(),
        Some(path) => format!("{} (not found, using defaults)", path.display()),
        None => "defaults".to_string(),
    };
    print_key_value("Source", &source);
    print_key_value(
        "Remote",
        if ctx.config.is_enabled() && ctx.config.is_valid_registry() {
            "enabled"
        } else {
            "disabled"
        },
    );
    println!();

    print!("{}", ctx.config.to_toml()?);
    Ok(())
}
