//! `steward init`: jobs directory, default role files, empty index.

use anyhow::Result;
use std::path::Path;

use crate::roles;
use crate::store::DirectoryManager;

pub fn init_command(jobs_dir: &Path) -> Result<()> {
    println!("steward init");

    let directory = DirectoryManager::new(jobs_dir);
    directory.ensure_base_structure()?;
    println!("  jobs directory: {}", jobs_dir.display());

    let written = roles::write_default_roles(jobs_dir)?;
    if written.is_empty() {
        println!("  role files: already present");
    } else {
        for path in written {
            println!("  wrote {}", path.display());
        }
    }

    println!("  index: {}", directory.index().path().display());
    Ok(())
}
