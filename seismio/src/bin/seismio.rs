//! The benchmark driver.
//!
//! Reads a run script from standard input, spins up one worker per process
//! grid cell, runs the write benchmark against a filesystem-backed output
//! directory, and optionally verifies the output and times a read-back pass.
//!
//! ```text
//! seismio [OUTPUT_DIR] [--verify] [--read] [--legacy-read] < run.script
//! ```

use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;

use seismio::bench::{run_write, WriteReport};
use seismio::config::RunConfig;
use seismio::decompose::OffsetConvention;
use seismio::fill::FillRegistry;
use seismio::provider::{FilesystemStoreProvider, StoreProvider};
use seismio::transport::{Communicator, LocalWorld};
use seismio::verify::{run_read, verify_container};
use seismio::{subfile_container_name, CONTAINER_NAME};

struct Options {
    output_dir: String,
    verify: bool,
    read: bool,
    legacy_read: bool,
}

fn parse_options() -> Result<Options, String> {
    let mut options = Options {
        output_dir: "seism-out".to_string(),
        verify: false,
        read: false,
        legacy_read: false,
    };
    for argument in std::env::args().skip(1) {
        match argument.as_str() {
            "--verify" => options.verify = true,
            "--read" => options.read = true,
            "--legacy-read" => options.legacy_read = true,
            flag if flag.starts_with("--") => return Err(format!("unknown flag {flag}")),
            path => options.output_dir = path.to_string(),
        }
    }
    Ok(options)
}

fn container_names(config: &RunConfig) -> Vec<String> {
    if config.subfile > 0 {
        (0..config.subfile).map(subfile_container_name).collect()
    } else {
        vec![CONTAINER_NAME.to_string()]
    }
}

fn print_report(config: &RunConfig, report: &WriteReport) {
    println!("process grid    {:?}", config.process_grid);
    println!("domain block    {:?}", config.domain_block);
    println!("chunk shape     {:?}", config.chunk_shape);
    println!("time steps      {}", config.time_steps);
    println!("transfer        {:?}", config.transfer);
    println!("precreate       {:?}", config.precreate);
    println!("create          {:.4} s", report.create_seconds);
    println!("write           {:.4} s", report.write_seconds);
    println!("close           {:.4} s", report.close_seconds);
    println!(
        "per-worker rate {:.2} MiB/s ({} bytes)",
        report.write_rate_mib_s(),
        report.bytes_written
    );
    println!("storage         {} bytes", report.storage_bytes);
}

fn run(options: &Options) -> Result<bool, Box<dyn std::error::Error>> {
    let mut script = String::new();
    std::io::stdin().read_to_string(&mut script)?;
    let config = RunConfig::from_script(script.as_bytes())?;
    let workers = usize::try_from(config.worker_count())?;
    let provider = Arc::new(FilesystemStoreProvider::new(&options.output_dir));

    // One communicator per worker; worker zero seeds the broadcast the same
    // way a distributed launch would.
    let handles: Vec<_> = LocalWorld::new(workers)
        .into_iter()
        .map(|communicator| {
            let seed = (communicator.rank() == 0).then(|| config.clone());
            let provider = provider.clone();
            std::thread::spawn(move || -> Result<WriteReport, String> {
                let config = RunConfig::broadcast(communicator.as_ref(), 0, seed)
                    .map_err(|err| err.to_string())?;
                let registry = FillRegistry::with_builtins();
                run_write(&config, &communicator, provider.as_ref(), &registry)
                    .map_err(|err| err.to_string())
            })
        })
        .collect();
    let mut reports = Vec::with_capacity(workers);
    for handle in handles {
        reports.push(handle.join().map_err(|_| "worker panicked")??);
    }
    print_report(&config, &reports[0]);

    let mut all_correct = true;
    if options.verify {
        for name in container_names(&config) {
            let report = verify_container(provider.store(&name)?)?;
            println!(
                "verify {name}: {} correct, {} incorrect",
                report.correct, report.incorrect
            );
            all_correct &= report.is_correct();
        }
    }

    if options.read || options.legacy_read {
        let convention = if options.legacy_read {
            OffsetConvention::LegacyGridCells
        } else {
            OffsetConvention::ElementOffsets
        };
        for name in container_names(&config) {
            let members: Vec<Arc<dyn Communicator>> =
                LocalWorld::new(usize::try_from(config.worker_count())?);
            let handles: Vec<_> = members
                .into_iter()
                .map(|communicator| {
                    let store = provider.store(&name);
                    std::thread::spawn(move || {
                        run_read(&communicator, store.map_err(|err| err.to_string())?, convention)
                            .map_err(|err| err.to_string())
                    })
                })
                .collect();
            for handle in handles {
                let report = handle.join().map_err(|_| "reader panicked")??;
                if options.legacy_read {
                    println!(
                        "read {name}: {:.2} MiB/s (historical offsets)",
                        report.read_rate_mib_s()
                    );
                } else {
                    println!("read {name}: {:.2} MiB/s", report.read_rate_mib_s());
                }
            }
        }
    }

    Ok(all_correct)
}

fn main() -> ExitCode {
    let options = match parse_options() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };
    match run(&options) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
