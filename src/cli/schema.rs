use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use binmux::config::settings_schema;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Write the schema to this file instead of stdout
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub async fn execute(args: SchemaArgs) -> anyhow::Result<()> {
    let schema = settings_schema()?;
    match args.out {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, schema).with_context(|| format!("writing {}", path.display()))?;
            println!("Schema written to {}", path.display());
        }
        None => println!("{schema}"),
    }
    Ok(())
}
