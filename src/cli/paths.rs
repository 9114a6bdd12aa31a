//! `hardenctl paths`: resolved directories, for debugging and scripting.

use anyhow::Result;

use super::load_config;

pub fn run(config_path: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let paths = &config.paths;

    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("Data:       {}", paths.data_dir.display());
    match config.definitions_override() {
        Some(dir) => println!("  definitions:    {}", dir.display()),
        None => println!("  definitions:    (bundled)"),
    }
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  snapshot:       {}", config.snapshot_path().display());
    println!("  audit journal:  {}", paths.audit_log().display());
    println!("  logs:           {}", paths.logs_dir().display());
    println!();
    match paths.runtime_dir {
        Some(ref dir) => println!("Runtime:    {}", dir.display()),
        None => println!("Runtime:    (not available)"),
    }
    println!("  run lock:       {}", paths.run_lock().display());

    Ok(())
}
