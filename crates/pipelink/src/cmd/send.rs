use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use pipelink_frame::JsonCodec;
use pipelink_peer::{Client, ClientConfig, ClientEvent, ConnectionId, HandshakeConfig, PeerError};
use pipelink_transport::PipeNamespace;
use serde_json::Value;

use crate::cmd::SendArgs;
use crate::exit::{peer_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_message, MessageOutput, OutputFormat};

type JsonClient = Client<Value, Value, JsonCodec>;

pub fn run(args: SendArgs, namespace: &PipeNamespace, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let message: Value = serde_json::from_str(&args.json)
        .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;

    let config = ClientConfig {
        namespace: namespace.clone(),
        auto_reconnect: false,
        handshake: HandshakeConfig {
            timeout,
            ..HandshakeConfig::default()
        },
        ..ClientConfig::default()
    };
    let (client, events) = JsonClient::with_codec(args.name.as_str(), config, JsonCodec)
        .map_err(|err| peer_error("send failed", err))?;
    client
        .start()
        .map_err(|err| peer_error("connect failed", err))?;

    if !client.wait_for_connection(Some(timeout)) {
        return Err(CliError::new(
            TIMEOUT,
            format!("no server answered on '{}' within {timeout:?}", args.name),
        ));
    }

    if !client.push_message(message) {
        return Err(CliError::new(
            FAILURE,
            "connection dropped before the message was queued",
        ));
    }
    if !client.flush(timeout) {
        return Err(CliError::new(TIMEOUT, "message was not delivered in time"));
    }

    if args.wait {
        let (id, reply) =
            wait_for_reply(&events, timeout).map_err(|err| peer_error("receive failed", err))?;
        print_message(&MessageOutput::new(&args.name, id.get(), &reply), format);
    }

    client.stop();
    Ok(SUCCESS)
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, scale) = if let Some(num) = input.strip_suffix("ms") {
        (num, Duration::from_millis(1))
    } else if let Some(num) = input.strip_suffix('s') {
        (num, Duration::from_secs(1))
    } else if let Some(num) = input.strip_suffix('m') {
        (num, Duration::from_secs(60))
    } else {
        (input, Duration::from_secs(1))
    };

    let value: u32 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(scale * value)
}

/// Wait for the first message from the server.
fn wait_for_reply(
    events: &Receiver<ClientEvent<Value>>,
    timeout: Duration,
) -> Result<(ConnectionId, Value), PeerError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(ClientEvent::Message { id, message }) => return Ok((id, message)),
            Ok(ClientEvent::Disconnected { .. }) => {
                return Err(PeerError::Disconnected(
                    "server closed the connection before replying".to_string(),
                ))
            }
            Ok(ClientEvent::Error { error, .. }) => return Err(error),
            Ok(ClientEvent::Connected { .. }) => {}
            Err(RecvTimeoutError::Timeout) => return Err(PeerError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(PeerError::Disconnected("client shut down".to_string()))
            }
        }
    }
}
