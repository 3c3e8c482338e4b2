//! A privileged "fan service" and a front-end talking typed messages.
//!
//! Run with:
//!   cargo run --example fan-service --features peer
//!
//! The service answers every command with a status; the front-end reconnects
//! by itself when the service is restarted halfway through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pipelink::peer::{Client, ClientConfig, ClientEvent, Server, ServerConfig, ServerEvent};
use pipelink::transport::PipeNamespace;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Command {
    SetDuty { fan: u8, percent: u8 },
    ReadStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Status {
    Duty { fan: u8, percent: u8 },
    Temperatures(Vec<(String, f32)>),
}

/// Runs the service on its own thread until `stop` is raised.
fn run_service(config: ServerConfig, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let (server, events) = match Server::<Command, Status>::new("fan-service", config) {
            Ok(pair) => pair,
            Err(err) => return eprintln!("service: {err}"),
        };
        if let Err(err) = server.start() {
            return eprintln!("service: {err}");
        }

        while !stop.load(Ordering::SeqCst) {
            let Ok(event) = events.recv_timeout(Duration::from_millis(100)) else {
                continue;
            };
            match event {
                ServerEvent::ClientMessage { name, message, .. } => {
                    let status = match message {
                        Command::SetDuty { fan, percent } => Status::Duty { fan, percent },
                        Command::ReadStatus => {
                            Status::Temperatures(vec![("cpu".to_string(), 58.0)])
                        }
                    };
                    if !server.push_message_to(status, &name) {
                        eprintln!("service: {name} left before its reply");
                    }
                }
                other => eprintln!("service: {other:?}"),
            }
        }
        if !server.flush(Duration::from_secs(1)) {
            eprintln!("service: replies still queued at shutdown");
        }
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = std::env::temp_dir().join(format!("pipelink-demo-{}", std::process::id()));
    let namespace = PipeNamespace::new(&dir);
    let server_config = ServerConfig {
        namespace: namespace.clone(),
        ..ServerConfig::default()
    };

    let stop = Arc::new(AtomicBool::new(false));
    let service = run_service(server_config.clone(), Arc::clone(&stop));

    let (client, replies) = Client::<Status, Command>::new(
        "fan-service",
        ClientConfig {
            namespace,
            ..ClientConfig::default()
        },
    )?;
    client.start()?;
    request(&client, &replies, Command::SetDuty { fan: 1, percent: 65 })?;

    eprintln!("restarting service");
    stop.store(true, Ordering::SeqCst);
    let _ = service.join();
    if !client.wait_for_disconnection(Some(Duration::from_secs(5))) {
        eprintln!("front-end: still connected after the service stopped");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let service = run_service(server_config, Arc::clone(&stop));
    request(&client, &replies, Command::ReadStatus)?;

    client.stop();
    stop.store(true, Ordering::SeqCst);
    let _ = service.join();
    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

/// Sends one command once connected and prints the service's answer.
fn request(
    client: &Client<Status, Command>,
    replies: &Receiver<ClientEvent<Status>>,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    if !client.wait_for_connection(Some(Duration::from_secs(5))) {
        return Err("service did not come up".into());
    }
    if !client.push_message(command) {
        return Err("connection dropped before the command was queued".into());
    }

    while let Ok(event) = replies.recv_timeout(Duration::from_secs(5)) {
        match event {
            ClientEvent::Message { message, .. } => {
                println!("reply: {message:?}");
                return Ok(());
            }
            other => eprintln!("front-end: {other:?}"),
        }
    }
    Err("no reply from the service".into())
}
