use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use pipelink_frame::JsonCodec;
use pipelink_peer::{Server, ServerConfig, ServerEvent};
use pipelink_transport::PipeNamespace;
use serde_json::Value;

use crate::cmd::ServeArgs;
use crate::exit::{peer_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_message, MessageOutput, OutputFormat};

const EVENT_POLL: Duration = Duration::from_millis(200);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type JsonServer = Server<Value, Value, JsonCodec>;

/// What to do with an incoming message besides printing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    None,
    Echo,
    Broadcast,
}

impl Reply {
    fn from_args(args: &ServeArgs) -> Self {
        if args.echo {
            Reply::Echo
        } else if args.broadcast {
            Reply::Broadcast
        } else {
            Reply::None
        }
    }
}

pub fn run(args: ServeArgs, namespace: &PipeNamespace, format: OutputFormat) -> CliResult<i32> {
    let config = ServerConfig {
        namespace: namespace.clone(),
        ..ServerConfig::default()
    };
    let (server, events) = JsonServer::with_codec(args.name.as_str(), config, JsonCodec)
        .map_err(|err| peer_error("serve failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    server
        .start()
        .map_err(|err| peer_error("serve failed", err))?;

    let reply = Reply::from_args(&args);
    let mut handled = 0usize;
    while running.load(Ordering::SeqCst) {
        let event = match events.recv_timeout(EVENT_POLL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if handle_event(&server, event, reply, format) {
            handled += 1;
            if args.count.is_some_and(|count| handled >= count) {
                break;
            }
        }
    }

    if !server.flush(SHUTDOWN_GRACE) {
        tracing::warn!("some replies were not delivered before shutdown");
    }
    server.stop();
    server.wait_for_stopped(Some(SHUTDOWN_GRACE));
    Ok(SUCCESS)
}

/// Returns true when the event carried a client message.
fn handle_event(
    server: &JsonServer,
    event: ServerEvent<Value>,
    reply: Reply,
    format: OutputFormat,
) -> bool {
    match event {
        ServerEvent::ClientConnected { id, name } => {
            tracing::info!(connection_id = %id, pipe = %name, "client connected");
            false
        }
        ServerEvent::ClientDisconnected { client } => {
            match client {
                Some((id, name)) => {
                    tracing::info!(connection_id = %id, pipe = %name, "client disconnected")
                }
                None => tracing::info!("client handshake abandoned"),
            }
            false
        }
        ServerEvent::Error { id, error } => {
            tracing::warn!(connection_id = ?id.map(|id| id.get()), error = %error, "server error");
            false
        }
        ServerEvent::ClientMessage { id, name, message } => {
            print_message(&MessageOutput::new(&name, id.get(), &message), format);
            match reply {
                Reply::None => {}
                Reply::Echo => {
                    if !server.push_message_to(message, &name) {
                        tracing::warn!(pipe = %name, "client left before echo");
                    }
                }
                Reply::Broadcast => {
                    let delivered = server.push_message(message);
                    tracing::debug!(delivered, "broadcast message");
                }
            }
            true
        }
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(echo: bool, broadcast: bool) -> ServeArgs {
        ServeArgs {
            name: "fanctl".to_string(),
            echo,
            broadcast,
            count: None,
        }
    }

    #[test]
    fn reply_mode_follows_flags() {
        assert_eq!(Reply::from_args(&args(false, false)), Reply::None);
        assert_eq!(Reply::from_args(&args(true, false)), Reply::Echo);
        assert_eq!(Reply::from_args(&args(false, true)), Reply::Broadcast);
    }

    #[test]
    fn only_messages_count_as_handled() {
        let (server, _events) = JsonServer::with_codec(
            "fanctl",
            ServerConfig {
                namespace: PipeNamespace::new("/tmp/pipelink-serve-unit"),
                ..ServerConfig::default()
            },
            JsonCodec,
        )
        .unwrap();
        let id = pipelink_peer::ConnectionId::new(1);

        assert!(!handle_event(
            &server,
            ServerEvent::ClientConnected {
                id,
                name: "fanctl_1".to_string()
            },
            Reply::None,
            OutputFormat::Json,
        ));
        assert!(!handle_event(
            &server,
            ServerEvent::ClientDisconnected { client: None },
            Reply::None,
            OutputFormat::Json,
        ));
        assert!(handle_event(
            &server,
            ServerEvent::ClientMessage {
                id,
                name: "fanctl_1".to_string(),
                message: serde_json::json!({ "fan": 1 }),
            },
            Reply::Echo,
            OutputFormat::Json,
        ));
    }
}
