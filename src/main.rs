use std::{
    fs::{create_dir_all, remove_dir_all},
    iter::repeat,
    path::Path,
};

use anyhow::{ensure, Context, Result};
use benchmark::benchmark;
use clap::Parser;
use command_parser::*;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod benchmark;
mod command_parser;
mod counter_lock;

fn init_tracing(verbose: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "info" })
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_names(true)
                .compact(),
        )
        .init();
}

fn main() -> Result<()> {
    let mut app = App::parse();

    init_tracing(app.global_opts.verbose);

    if app.global_opts.cpus.len() != 1 {
        ensure!(
            app.global_opts.cpus.len() == app.global_opts.threads.len(),
            "--cpus takes one value or one per --threads entry"
        );
    }

    if app.global_opts.cpus.len() == 1 {
        app.global_opts.cpus = repeat(app.global_opts.cpus[0])
            .take(app.global_opts.threads.len())
            .collect();
    }

    ensure!(
        app.global_opts.cpus.iter().all(|&cpu| cpu > 0),
        "cpu counts must be positive"
    );

    let output_path = Path::new(app.global_opts.output_path.as_str());

    if output_path.is_dir() {
        remove_dir_all(output_path).context("Error removing output dir")?;
    }

    create_dir_all(output_path).context("Error creating output dir")?;

    for (ncpu, nthread) in app
        .global_opts
        .cpus
        .iter()
        .zip(&app.global_opts.threads)
    {
        info!(cpus = ncpu, threads = nthread, "starting benchmark");
        benchmark(*ncpu, *nthread, app.lock_target, &app.global_opts)?;
    }

    Ok(())
}
