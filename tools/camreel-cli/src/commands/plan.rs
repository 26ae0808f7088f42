//! Show how multi-part recordings would be merged.

use std::path::PathBuf;

use camreel_common::AppConfig;
use camreel_processing_core::{merge_plan, MergeCandidate, Segment};

pub fn run(config: &AppConfig, paths: Vec<PathBuf>, json: bool) -> anyhow::Result<()> {
    let extension = config.video.output_format.extension();
    let plan = merge_plan::plan(paths.into_iter().map(|source| {
        let output = source.with_extension(extension);
        MergeCandidate::new(source, output)
    }));

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("Merge Plan");
    println!("{}", "=".repeat(50));

    if plan.groups.is_empty() {
        println!("No multi-part recordings found.");
    }
    for group in &plan.groups {
        let concat = group.concat_plan(&config.merge);
        println!("{} ({} parts)", group.base, group.parts.len());
        for segment in &concat.segments {
            match segment {
                Segment::Recording { path, index } => {
                    println!("  [{index}] {}", path.display());
                }
                Segment::TitleCard(card) => {
                    println!(
                        "      title card \"{}\" ({}s, {} on {})",
                        card.label, card.duration_secs, card.text_color, card.background
                    );
                }
            }
        }
        println!("  -> {}", concat.output.display());
        println!();
    }

    if !plan.standalone.is_empty() {
        println!("Standalone:");
        for candidate in &plan.standalone {
            println!("  {}", candidate.source.display());
        }
    }

    if !config.merge.enabled {
        println!();
        println!("[WARN] Merging is disabled in the config; `camreel run --merge` enables it per run.");
    }

    Ok(())
}
