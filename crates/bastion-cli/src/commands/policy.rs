//! `bastion policy` command.
//!
//! Prints the merged configuration every other command would run under.

use clap::Args;

use bastion_config::BastionConfig;

/// Print the merged, validated configuration.
#[derive(Debug, Args)]
pub struct PolicyArgs {
    /// Print JSON instead of TOML.
    #[arg(long)]
    pub json: bool,
}

/// Renders `config` in the requested format.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn render(args: &PolicyArgs, config: &BastionConfig) -> anyhow::Result<String> {
    if args.json {
        Ok(serde_json::to_string_pretty(config)?)
    } else {
        Ok(toml::to_string_pretty(config)?)
    }
}

/// Executes the policy command.
pub fn execute(args: &PolicyArgs, config: &BastionConfig) -> anyhow::Result<()> {
    println!("{}", render(args, config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_lists_every_section() {
        let text = render(&PolicyArgs { json: false }, &BastionConfig::default()).expect("toml");
        for section in ["[filesystem]", "[network]", "[limits]", "[sandbox]", "[logging]"] {
            assert!(text.contains(section), "missing {section}");
        }
    }

    #[test]
    fn json_round_trips() {
        let text = render(&PolicyArgs { json: true }, &BastionConfig::default()).expect("json");
        let back: BastionConfig = serde_json::from_str(&text).expect("parse");
        assert_eq!(back, BastionConfig::default());
    }
}
