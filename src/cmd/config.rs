//! Config command.
//!
//! Prints the effective configuration after every layer has been merged.

use std::path::PathBuf;

use console::style;

use crate::{Result, config::Config};

pub fn execute(root: Option<PathBuf>) -> Result<()> {
   let cfg = Config::load_with_root(root.as_deref())?;
   if let Some(path) = crate::config::base_dir().map(|d| d.join("config.toml")) {
      let note = if path.exists() { "loaded" } else { "not present" };
      println!("{}", style(format!("# global config: {} ({note})", path.display())).dim());
   }
   if let Some(root) = &root {
      let path = crate::config::root_config_path(root);
      let note = if path.exists() { "loaded" } else { "not present" };
      println!("{}", style(format!("# vault config: {} ({note})", path.display())).dim());
   }
   print!("{}", toml::to_string_pretty(&cfg)?);
   Ok(())
}
