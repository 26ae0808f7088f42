//! List encoding profiles.

use camreel_common::{profile_defaults, AppConfig, Profile};

pub fn run(config: &AppConfig) -> anyhow::Result<()> {
    println!("Encoding Profiles");
    println!("{}", "=".repeat(50));

    for profile in Profile::ALL {
        let marker = if profile == config.video.profile {
            " (configured)"
        } else {
            ""
        };
        println!("{profile}{marker}");

        let fields = profile_defaults(profile);
        let mut any = false;
        let mut show = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                println!("  {name:<14} {value}");
                any = true;
            }
        };
        show("encoder", fields.encoder.map(|e| e.to_string()));
        show("lossless", fields.lossless.map(|l| l.to_string()));
        show("preset", fields.preset);
        show("crf", fields.crf.map(|c| c.to_string()));
        show(
            "output format",
            fields.output_format.map(|f| f.extension().to_string()),
        );
        if !any {
            println!("  (uses the configured values as they are)");
        }
        println!();
    }

    Ok(())
}
