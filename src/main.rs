mod battery;
mod ble_transport;
mod config;
mod connection;
mod device_scanner;
mod error;
#[cfg(test)]
mod mock_transport;
mod policy;
mod protocol;
mod run_controller;
mod session;
mod telemetry;
mod timers;
mod transport;

use config::Config;
use connection::{ConnectionManager, SessionHandle};
use error::ConnectionError;
use session::{SessionStatus, SessionUpdate};
use std::io::BufRead;

const HELP: &str = "commands: scan | start [strength] [minutes] | stop | strength <1-9> | poll | disconnect | quit";

fn main() {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Using default settings: {}", e);
            Config::default()
        }
    };

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level)).init();
    log::info!("Starting vagus-link");

    // Channel for session updates flowing back to the console
    let (update_sender, update_receiver) = crossbeam_channel::unbounded::<SessionUpdate>();

    let (manager, handle) = ConnectionManager::new(config.clone(), update_sender);
    let session_thread = std::thread::spawn(move || manager.run());

    std::thread::spawn(move || {
        for update in update_receiver {
            match update {
                SessionUpdate::Status(status) => println!("{}", describe(&status)),
                SessionUpdate::Condition(condition) => println!("! {}", condition),
            }
        }
    });

    println!("{}", HELP);
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        match dispatch(&handle, &config, &line) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                println!("! {}", e);
                break;
            }
        }
    }

    let _ = handle.shutdown();
    if session_thread.join().is_err() {
        log::error!("Session thread panicked");
    }
}

/// Translate one console line into an intent. Returns `Ok(false)` to quit.
fn dispatch(handle: &SessionHandle, config: &Config, line: &str) -> Result<bool, ConnectionError> {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("scan") => handle.scan()?,
        Some("start") => {
            let strength = words
                .next()
                .and_then(|w| w.parse().ok())
                .unwrap_or(config.default_strength);
            let minutes = words
                .next()
                .and_then(|w| w.parse().ok())
                .unwrap_or(config.default_duration_minutes);
            handle.start(strength, minutes)?;
        }
        Some("stop") => handle.stop()?,
        Some("strength") => match words.next().and_then(|w| w.parse().ok()) {
            Some(value) => handle.set_strength(value)?,
            None => println!("usage: strength <1-9>"),
        },
        Some("poll") => handle.toggle_polling()?,
        Some("disconnect") => handle.disconnect()?,
        Some("quit") | Some("exit") => return Ok(false),
        Some(_) => println!("{}", HELP),
        None => {}
    }
    Ok(true)
}

fn describe(status: &SessionStatus) -> String {
    let battery = match (status.telemetry.battery_percent, status.telemetry.battery_voltage) {
        (Some(percent), Some(volts)) => format!("{}% ({:.2} V)", percent, volts),
        (Some(percent), None) => format!("{}%", percent),
        _ => "?".to_string(),
    };
    let updated = status
        .telemetry
        .last_updated
        .map(|t| format!(" @ {}", t.format("%H:%M:%S")))
        .unwrap_or_default();
    let charging = match status.telemetry.charging {
        Some(true) => "charging",
        Some(false) => "on battery",
        None => "charge unknown",
    };
    let run = if status.params.running {
        format!(
            "running at {} ({}s left of {} min)",
            status.params.strength, status.params.remaining_seconds, status.params.duration_minutes
        )
    } else {
        format!("idle (strength {})", status.params.strength)
    };

    format!(
        "[{}{}] battery {} {}{} | {} | polling {}",
        status.connection,
        status.device.as_deref().map(|d| format!(" {}", d)).unwrap_or_default(),
        battery,
        charging,
        updated,
        run,
        if status.polling { "on" } else { "off" },
    )
}
