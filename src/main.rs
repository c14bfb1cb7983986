mod config;
mod cpio;
mod decrypt;
mod display;
mod error;
mod file_entry;
mod file_types;
mod gzip_stream;
mod layout;
mod mount;
mod processor;
mod report;
mod unpack;
mod zip_utils;

use std::env;
use std::path::Path;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use config::Config;
use decrypt::Pc1Decryptor;
use mount::SystemMounter;
use processor::Extractor;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();
    let Some((source, dest)) = positionals(&args) else {
        let program = args.first().map(String::as_str).unwrap_or("qnapfw");
        println!("Usage: {} <firmware image or directory> <destination>", program);
        println!();
        println!("Unpacks a NAS firmware image into <destination>/sysroot.");
        println!("<destination> must not exist yet.");
        return ExitCode::SUCCESS;
    };

    let config = Config::from_env();
    let decryptor = Pc1Decryptor::from_config(&config);
    let mounter = SystemMounter::new(config.flash);

    match Extractor::new(&mounter, &decryptor).run(source, dest) {
        Ok(report) => {
            let failed = report
                .stages
                .iter()
                .filter(|s| !s.outcome.is_success())
                .count();
            println!(
                "Extracted {} ({}) in {} steps, {} failed",
                source.display(),
                report.input_kind,
                report.stages.len(),
                failed
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Source and destination, when exactly those two arguments were given
fn positionals(args: &[String]) -> Option<(&Path, &Path)> {
    match args {
        [_, source, dest] => Some((Path::new(source), Path::new(dest))),
        _ => None,
    }
}
