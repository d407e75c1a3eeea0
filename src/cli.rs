//! 命令行界面定义
//!
//! 定义了主程序的命令行参数和选项
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "reportgate")]
#[command(version)]
#[command(
    about = "Encrypted health report service with email one-time codes and decryption tokens"
)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Option<Commands>,

    /// Configuration file path (defaults to searching standard locations)
    #[arg(short, long, default_value = "config.toml")]
    pub(crate) config: PathBuf,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Test configuration file
    Test {
        /// Configuration file path (optional, defaults to config.toml)
        #[arg(index = 1)]
        config_file: Option<PathBuf>,
    },
    /// Generate a new 256-bit report encryption key (hex)
    Keygen,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::parse_from(["reportgate", "test", "custom.toml"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Test { config_file: Some(ref p) }) if p == &PathBuf::from("custom.toml")
        ));

        let cli = Cli::parse_from(["reportgate", "--config", "/tmp/rg.toml", "keygen"]);
        assert!(matches!(cli.command, Some(Commands::Keygen)));
        assert_eq!(cli.config, PathBuf::from("/tmp/rg.toml"));

        let cli = Cli::parse_from(["reportgate"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("config.toml"));
    }
}
