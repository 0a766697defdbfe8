//! Test command implementation.

use oxizip_archive::{ReadOptions, ZipArchive};
use std::path::Path;

pub fn cmd_test(
    archive: &Path,
    password: Option<String>,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = ReadOptions {
        password,
        ..ReadOptions::default()
    };
    let mut zip = ZipArchive::open_with(archive, options)?;

    println!("Testing {}", archive.display());
    if zip.was_recovered() {
        println!("  warning: central directory missing, entries recovered from local headers");
    }

    let names: Vec<String> = zip
        .entries()
        .iter()
        .filter(|e| !e.is_directory())
        .map(|e| e.name().to_string())
        .collect();

    let mut ok_count = 0usize;
    let mut errors: Vec<(String, String)> = Vec::new();

    for name in &names {
        match zip.check(name) {
            Ok(_) => {
                ok_count += 1;
                if verbose {
                    println!("  OK: {}", name);
                }
            }
            Err(e) => {
                if verbose {
                    println!("  FAILED: {} - {}", name, e);
                }
                errors.push((name.clone(), e.to_string()));
            }
        }
    }

    println!();
    println!(
        "Tested {} files: {} OK, {} failed",
        names.len(),
        ok_count,
        errors.len()
    );

    if errors.is_empty() {
        println!("No errors detected.");
        Ok(())
    } else {
        if !verbose {
            for (name, error) in &errors {
                println!("  {}: {}", name, error);
            }
        }
        Err(format!("{} entries failed verification", errors.len()).into())
    }
}
