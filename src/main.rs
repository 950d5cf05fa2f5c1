use carlink::mqtt::codec::DriveAction;
use carlink::{AppConfig, ConnectionManager, ConnectionState};
use color_eyre::{eyre::eyre, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// A parsed line from the operator
#[derive(Debug, PartialEq)]
enum Input {
    Drive(DriveAction),
    Raw(String),
    Connect,
    Disconnect,
    Status,
    Quit,
}

fn parse_input(line: &str) -> Option<Input> {
    let word = line.trim();
    if word.is_empty() {
        return None;
    }

    let input = match word.to_ascii_lowercase().as_str() {
        "w" => Input::Drive(DriveAction::Forward),
        "s" => Input::Drive(DriveAction::Backward),
        "a" => Input::Drive(DriveAction::Left),
        "d" => Input::Drive(DriveAction::Right),
        "x" => Input::Drive(DriveAction::Stop),
        "connect" => Input::Connect,
        "disconnect" => Input::Disconnect,
        "status" => Input::Status,
        "quit" | "exit" | "q" => Input::Quit,
        other => match other.parse::<DriveAction>() {
            Ok(action) => Input::Drive(action),
            Err(_) => Input::Raw(word.to_string()),
        },
    };
    Some(input)
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = AppConfig::load().await?;
    info!("Broker {} for device {}", config.broker_url(), config.device_id);

    let manager = ConnectionManager::with_mqtt().map_err(|e| eyre!("Failed to start MQTT: {}", e))?;
    let watchers = spawn_watchers(&manager);

    if let Err(e) = manager.connect(config.endpoint(), config.connect_options()) {
        // Already on the error channel; the operator can fix the config and retry
        warn!("Initial connect rejected: {}", e);
    }

    info!("Commands: w/s/a/d/x, connect, disconnect, status, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        debug!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        break;
                    }
                };

                match parse_input(&line) {
                    None => {}
                    Some(Input::Quit) => break,
                    Some(Input::Drive(action)) => {
                        let _ = manager.drive(action);
                    }
                    Some(Input::Raw(action)) => {
                        let _ = manager.send(&action);
                    }
                    Some(Input::Connect) => {
                        let _ = manager.connect(config.endpoint(), config.connect_options());
                    }
                    Some(Input::Disconnect) => manager.disconnect(),
                    Some(Input::Status) => print_status(&manager),
                }
            }
        }
    }

    manager.disconnect();
    for watcher in watchers {
        watcher.abort();
    }
    info!("Bye");
    Ok(())
}

fn print_status(manager: &ConnectionManager) {
    let events = manager.events();
    info!("Connection: {}", events.connection_state());
    if let Some(endpoint) = manager.endpoint() {
        info!("Endpoint: {}", endpoint);
    }
    info!("Telemetry: {}", events.latest_telemetry());
    info!("Device: {}", events.latest_status());
    if let Some(command) = manager.last_command() {
        info!("Last command: {} ({})", command.action, command.command_id);
    }
}

/// One task per event channel, logging every change
fn spawn_watchers(manager: &ConnectionManager) -> Vec<JoinHandle<()>> {
    let mut connection = manager.subscribe_connection();
    let mut telemetry = manager.subscribe_telemetry();
    let mut status = manager.subscribe_status();
    let mut errors = manager.subscribe_errors();

    vec![
        tokio::spawn(async move {
            while connection.changed().await.is_ok() {
                let state = *connection.borrow_and_update();
                match state {
                    ConnectionState::Connected => info!("● {}", state),
                    _ => warn!("○ {}", state),
                }
            }
        }),
        tokio::spawn(async move {
            while telemetry.changed().await.is_ok() {
                let reading = telemetry.borrow_and_update().clone();
                if !reading.is_reset() {
                    info!(
                        "Battery {} | Front {} | {} | {} | WiFi {} | Heap {}",
                        reading.battery_display(),
                        reading.distance_display(),
                        reading.temperature_display(),
                        reading.action_display(),
                        reading.rssi_display(),
                        reading.free_heap_display()
                    );
                }
            }
        }),
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let device = status.borrow_and_update().clone();
                if !device.device_id.is_empty() {
                    info!("Car {}", device);
                }
            }
        }),
        tokio::spawn(async move {
            while errors.changed().await.is_ok() {
                if let Some(event) = errors.borrow_and_update().clone() {
                    error!("{}", event);
                }
            }
        }),
    ]
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("w"), Some(Input::Drive(DriveAction::Forward)));
        assert_eq!(parse_input(" back "), Some(Input::Drive(DriveAction::Backward)));
        assert_eq!(parse_input("X"), Some(Input::Drive(DriveAction::Stop)));
        assert_eq!(parse_input("status"), Some(Input::Status));
        assert_eq!(parse_input("honk"), Some(Input::Raw("honk".to_string())));
        assert_eq!(parse_input("   "), None);
    }
}
