// main.rs — myrad command line front end

mod compile;
mod handlers;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use myrad_common::console::set_verbose;
use myrad_lighting::context::RadSettings;

use crate::compile::{compile_map, run_worker_mode, RunMode};

/// Radiosity lightmap compiler for IBSP maps.
#[derive(Parser, Debug)]
#[command(name = "myrad", version, about)]
struct Args {
    /// Compiled map to light (rewritten in place)
    bsp: PathBuf,

    /// Maximum patch size in world units
    #[arg(long, default_value_t = 64.0)]
    chop: f32,

    /// Radiosity bounce iterations (0 disables bounce lighting)
    #[arg(long, default_value_t = 8)]
    bounces: i32,

    /// Quarter the hemisphere sampling for quick previews
    #[arg(long)]
    fast: bool,

    /// Multiplier on sky/indirect hemisphere sample counts
    #[arg(long, default_value_t = 1.0)]
    sky_sample_scale: f32,

    /// Global light intensity multiplier
    #[arg(long, default_value_t = 1.0)]
    light_scale: f32,

    /// Worker threads (0 = one per core)
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Incremental lighting cache file
    #[arg(long)]
    incremental: Option<PathBuf>,

    /// Coordinate a distributed run, listening on this address
    #[arg(long, value_name = "ADDR")]
    mpi_master: Option<String>,

    /// Workers to wait for before a distributed run starts
    #[arg(long, default_value_t = 1)]
    mpi_workers: usize,

    /// Serve a distributed run as a worker, connecting to this master
    #[arg(long, value_name = "ADDR", conflicts_with = "mpi_master")]
    mpi_worker: Option<String>,

    /// Chatty progress output
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();
    set_verbose(args.verbose);

    if args.threads > 0 {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(args.threads)
            .build_global()
        {
            log::warn!("thread pool setup failed: {}", e);
        }
    }

    let settings = RadSettings {
        chop: args.chop.max(4.0),
        num_bounces: args.bounces.max(0),
        fast: args.fast,
        sky_sample_scale: args.sky_sample_scale.clamp(0.1, 16.0),
        threads: args.threads,
        light_scale: args.light_scale,
        incremental_file: args.incremental,
    };

    let result = if let Some(addr) = args.mpi_worker {
        run_worker_mode(&addr, &args.bsp, settings)
    } else {
        let mode = match args.mpi_master {
            Some(listen) => RunMode::Master {
                listen,
                min_workers: args.mpi_workers.max(1),
            },
            None => RunMode::Local,
        };
        compile_map(&args.bsp, settings, mode)
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("************ ERROR ************\n{}", e);
            ExitCode::FAILURE
        }
    }
}
