//! Role file commands.

use anyhow::Result;
use std::path::Path;

use crate::roles;

pub fn list_command(jobs_dir: &Path) -> Result<()> {
    println!("steward role list");

    let found = roles::list_roles(jobs_dir);
    if found.is_empty() {
        println!("  no role files found; run 'steward init' to create defaults");
        return Ok(());
    }
    for role in found {
        println!(
            "  {role}: {}",
            roles::role_file_path(jobs_dir, &role).display()
        );
    }
    Ok(())
}

pub fn inspect_command(jobs_dir: &Path, name: &str) -> Result<()> {
    println!("steward role inspect");

    let content = roles::inspect_role(jobs_dir, name)?;
    println!("{content}");
    Ok(())
}
