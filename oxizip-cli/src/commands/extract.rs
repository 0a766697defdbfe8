//! Extract command implementation.

use crate::utils::{create_progress_bar, matches_filters, read_options};
use dialoguer::{Confirm, Password};
use indicatif::ProgressBar;
use oxizip_archive::{ExtractExistingFile, ExtractOutcome, Reply, ZipArchive, ZipEvent};
use oxizip_core::ZipError;
use std::path::Path;

/// Options for extraction.
pub struct ExtractOptions<'a> {
    pub output: &'a Path,
    pub files: &'a [String],
    pub include: &'a [String],
    pub exclude: &'a [String],
    pub existing: ExtractExistingFile,
    pub password: Option<String>,
    pub encoding: Option<&'a str>,
    pub verbose: bool,
    pub progress: bool,
}

/// Event handler: answers overwrite questions on the terminal and moves the
/// progress bar.
fn event_handler(pb: ProgressBar) -> impl FnMut(&ZipEvent<'_>) -> Reply + Send + 'static {
    move |event: &ZipEvent<'_>| match event {
        ZipEvent::ExtractExisting { path, .. } => {
            let answer = pb.suspend(|| {
                Confirm::new()
                    .with_prompt(format!("{} exists. Overwrite?", path.display()))
                    .default(false)
                    .interact()
            });
            match answer {
                Ok(true) => Reply::Overwrite,
                Ok(false) => Reply::Skip,
                Err(_) => Reply::Cancel,
            }
        }
        ZipEvent::ExtractEntryStarted { name } => {
            pb.set_message(name.to_string());
            Reply::Continue
        }
        _ => Reply::Continue,
    }
}

pub fn cmd_extract(
    archive: &Path,
    options: &ExtractOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut zip = ZipArchive::open_with(
        archive,
        read_options(options.password.clone(), options.encoding)?,
    )?;
    zip.set_extract_existing(options.existing);

    let names: Vec<String> = zip
        .entries()
        .iter()
        .map(|e| e.name().to_string())
        .filter(|name| options.files.is_empty() || options.files.iter().any(|f| f == name))
        .filter(|name| matches_filters(name, options.include, options.exclude))
        .collect();

    let pb = create_progress_bar(names.len() as u64, options.progress && !options.verbose);
    zip.set_event_sink(event_handler(pb.clone()));
    std::fs::create_dir_all(options.output)?;

    let mut extracted = 0usize;
    let mut skipped = 0usize;
    for name in &names {
        let outcome = match zip.extract_to_dir(name, options.output) {
            Err(ZipError::PasswordRequired { .. }) if options.password.is_none() => {
                tracing::debug!(entry = %name, "prompting for password");
                let password = pb.suspend(|| {
                    Password::new()
                        .with_prompt(format!("Password for {name}"))
                        .interact()
                })?;
                zip.set_password(Some(password));
                zip.extract_to_dir(name, options.output)?
            }
            other => other?,
        };

        match outcome {
            ExtractOutcome::Extracted => {
                extracted += 1;
                if options.verbose {
                    println!("  extracted: {name}");
                }
            }
            ExtractOutcome::Skipped => {
                skipped += 1;
                if options.verbose {
                    println!("  skipped: {name}");
                }
            }
            ExtractOutcome::Cancelled => {
                pb.abandon_with_message("cancelled");
                return Err("extraction cancelled".into());
            }
        }
        pb.inc(1);
    }

    pb.finish_with_message("done");
    println!(
        "Extracted {} entries to {} ({} skipped)",
        extracted,
        options.output.display(),
        skipped
    );
    Ok(())
}
