use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_PATH;

#[derive(Parser)]
#[command(name = "lanshare")]
#[command(about = "🖥️ LAN screen sharing: one presenter, many viewers", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to configuration TOML file
    #[arg(short, long, global = true, default_value = DEFAULT_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the sharing server
    Serve {
        /// Address to bind to (overrides the config file)
        #[arg(short, long)]
        addr: Option<String>,

        /// Initial preset: hd60 or 4k30
        #[arg(short, long)]
        preset: Option<String>,

        /// ffmpeg executable
        #[arg(long)]
        ffmpeg: Option<PathBuf>,
    },

    /// List capturable monitors and windows
    Sources,

    /// Check ffmpeg and hardware encoder availability
    Probe,

    /// Print the default configuration and exit
    GenConfig {
        /// Write it to the --config path instead of stdout
        #[arg(short, long)]
        write: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_overrides_parse() {
        let cli = Cli::try_parse_from([
            "lanshare", "serve", "--addr", "127.0.0.1:9000", "--preset", "4k30", "-c", "x.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        let Commands::Serve { addr, preset, ffmpeg } = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(addr.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(preset.as_deref(), Some("4k30"));
        assert!(ffmpeg.is_none());
    }

    #[test]
    fn config_defaults_to_local_file() {
        let cli = Cli::try_parse_from(["lanshare", "gen-config"]).unwrap();
        assert_eq!(cli.config, PathBuf::from(DEFAULT_PATH));
        assert!(matches!(cli.command, Commands::GenConfig { write: false }));
    }
}
