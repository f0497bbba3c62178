//! Line-oriented console over the channel controller
//!
//! A number selects a channel, `r`/`p`/`s` record, play and stop the
//! selected channel, `status` prints every channel as JSON and `q` quits.

use crate::controller::ChannelController;
use crate::models::{ChannelEvent, ChannelEventKind};
use anyhow::Result;
use crossbeam_channel::Receiver;
use std::io::{BufRead, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Select(usize),
    Record,
    Play,
    Stop,
    Status,
    Help,
    Quit,
    Unknown,
}

/// Parse one input line
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Ok(channel) = line.parse::<usize>() {
        return Some(Command::Select(channel));
    }
    let command = match line.to_ascii_lowercase().as_str() {
        "r" | "record" => Command::Record,
        "p" | "play" => Command::Play,
        "s" | "stop" => Command::Stop,
        "status" => Command::Status,
        "h" | "help" | "?" => Command::Help,
        "q" | "quit" | "exit" => Command::Quit,
        _ => Command::Unknown,
    };
    Some(command)
}

const HELP: &str = "0-9 select channel, r record, p play, s stop, status, q quit";

/// Run the console until `q` or end of input
pub fn run(controller: &ChannelController, input: impl BufRead, mut out: impl Write) -> Result<()> {
    let mut selected = 0usize;
    writeln!(
        out,
        "{} channels on {}. {}",
        controller.channel_count(),
        controller.backend_name(),
        HELP
    )?;

    for line in input.lines() {
        let Some(command) = parse_command(&line?) else {
            continue;
        };

        let result = match command {
            Command::Select(channel) if channel < controller.channel_count() => {
                selected = channel;
                writeln!(out, "channel {} selected", selected)?;
                Ok(())
            }
            Command::Select(channel) => {
                writeln!(
                    out,
                    "no channel {} (0..{})",
                    channel,
                    controller.channel_count()
                )?;
                Ok(())
            }
            Command::Record => controller.record(selected),
            Command::Play => controller.play(selected),
            Command::Stop => controller.stop(selected),
            Command::Status => {
                writeln!(out, "{}", serde_json::to_string_pretty(&controller.status())?)?;
                Ok(())
            }
            Command::Help | Command::Unknown => {
                writeln!(out, "{}", HELP)?;
                Ok(())
            }
            Command::Quit => break,
        };

        if let Err(err) = result {
            writeln!(out, "channel {}: {}", selected, err)?;
        }
        out.flush()?;
    }
    Ok(())
}

/// Render an event for the terminal
pub fn format_event(event: &ChannelEvent, json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string(event)?);
    }
    let time = event.at.with_timezone(&chrono::Local).format("%H:%M:%S%.3f");
    let text = match &event.kind {
        ChannelEventKind::Recording => "recording".to_string(),
        ChannelEventKind::Playing => "playing".to_string(),
        ChannelEventKind::Stopped => "stopped".to_string(),
        ChannelEventKind::LoopCompleted { cycles } => format!("loop {}", cycles),
        ChannelEventKind::Failed { message, .. } => format!("failed: {}", message),
    };
    Ok(format!("[{}] channel {}: {}", time, event.channel, text))
}

/// Print events until the controller goes away
pub fn print_events(events: Receiver<ChannelEvent>, json: bool) {
    for event in events.iter() {
        match format_event(&event, json) {
            Ok(line) => println!("{}", line),
            Err(e) => log::error!("Failed to format event: {}", e),
        }
    }
}
