//! Loopstation - a multi-channel audio looper
//!
//! This is the main entry point for the Loopstation console.

mod audio;
mod cli;
mod console;
mod controller;
mod error;
mod models;
mod settings;

use anyhow::Context;
use clap::Parser;
use controller::ChannelController;
use log::info;
use models::LooperConfig;
use std::io;
use std::thread;

fn main() -> anyhow::Result<()> {
    // Parse command-line arguments and initialize logging
    let args = cli::Args::parse();
    cli::init_logging(&args);

    info!("Starting Loopstation");

    // Defaults, then dconf, then flags
    let mut config = LooperConfig::default();
    settings::apply_stored(&mut config);
    args.apply(&mut config);
    if args.save_settings {
        settings::save(&config);
    }

    let backend = audio::select_backend(config.backend).context("No usable audio backend")?;
    let controller = ChannelController::new(&config, backend).with_context(|| {
        format!(
            "Cannot use recordings directory {}",
            config.recordings_dir.display()
        )
    })?;

    let events = controller.events();
    let json = args.json_events;
    thread::Builder::new()
        .name("event-printer".to_string())
        .spawn(move || console::print_events(events, json))
        .context("Failed to start event printer")?;

    console::run(&controller, io::stdin().lock(), io::stdout())?;

    controller.shutdown();
    info!("Loopstation stopped");
    Ok(())
}
