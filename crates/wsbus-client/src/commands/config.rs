//! Configuration commands.

use crate::config::ClientConfig;
use crate::error::ClientResult;

/// Prints the effective configuration to stdout.
pub fn dump(config: &ClientConfig) -> ClientResult<()> {
    println!("# client.toml ({})", ClientConfig::default_path().display());
    println!("{}", config.to_toml()?);
    Ok(())
}

/// Prints the default configuration file path.
pub fn path() -> ClientResult<()> {
    println!("{}", ClientConfig::default_path().display());
    Ok(())
}
