// ABOUTME: CLI command listing container language profiles
// ABOUTME: Shows the bundled table merged with any configured override file

use anyhow::Result;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};

use runbox_config::EngineSettings;
use runbox_sandboxes::LanguageProfiles;

pub fn languages_command(settings: &EngineSettings) -> Result<()> {
    let profiles = LanguageProfiles::load(settings.language_profiles_path.as_deref())?;

    println!("{}", "Container language profiles".blue().bold());
    if let Some(path) = &settings.language_profiles_path {
        println!("{}", format!("Overrides from {}", path.display()).dimmed());
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Language", "Aliases", "Image", "Run", "Tests"]);

    for profile in profiles.list() {
        let aliases = if profile.aliases.is_empty() {
            "-".to_string()
        } else {
            profile.aliases.join(", ")
        };
        table.add_row(vec![
            profile.id.clone(),
            aliases,
            profile.image.clone(),
            profile.run_command(),
            profile.test_command().unwrap_or_else(|| "-".to_string()),
        ]);
    }

    println!("{}", table);
    Ok(())
}
