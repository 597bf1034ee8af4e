//! Per-connection session drivers.
//!
//! A streaming session authenticates, then runs a reader task that routes
//! inbound envelopes and a writer loop that drains the mailbox and sends
//! heartbeats. A long-poll session binds the identity it was given, applies
//! the optional page and command, and waits for exactly one message.
//!
//! Every path out of a session goes through [`Socket::close`].

use courier_protocol::decode_envelope;
use courier_transport::{CloseCode, EnvelopeReader, MessageWriter, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, trace};

use crate::hub::Hub;
use crate::router::Router;
use crate::socket::{Mailbox, Socket};
use crate::telemetry::SharedTelemetry;

/// How long a closing session waits for its reader task.
const READER_GRACE: Duration = Duration::from_secs(1);

/// Drive a streaming connection until either side closes or the hub shuts
/// down.
pub async fn serve_stream<R, W>(hub: Arc<Hub>, mut reader: R, mut writer: W)
where
    R: EnvelopeReader + 'static,
    W: MessageWriter,
{
    let kind = writer.kind();
    let telemetry = Arc::clone(hub.telemetry());
    let (socket, mailbox) = hub.new_socket(kind);
    telemetry.connection_opened(kind);
    debug!(socket = %socket.id(), transport = %kind, "Connected");

    let handshake = timeout(
        hub.config().session.auth_timeout,
        socket.authenticate_stream(&mut reader),
    )
    .await;
    let authenticated = match handshake {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(socket = %socket.id(), error = %e, "Handshake failed");
            false
        }
        Err(_) => {
            debug!(socket = %socket.id(), "Handshake timed out");
            false
        }
    };

    if !authenticated {
        socket.close().await;
        if let Err(e) = writer.close(CloseCode::Error).await {
            trace!(socket = %socket.id(), error = %e, "Close frame not sent");
        }
        telemetry.connection_closed(kind);
        return;
    }

    let reader_task = tokio::spawn(read_loop(
        Arc::clone(hub.router()),
        Arc::clone(&socket),
        reader,
        Arc::clone(&telemetry),
    ));

    let code = write_loop(&hub, &socket, mailbox, &mut writer).await;
    if socket.close().await {
        reader_task.abort();
    } else {
        // The reader may still be clearing presence after its own close
        drain_reader(&socket, reader_task).await;
    }

    if let Err(e) = writer.close(code).await {
        trace!(socket = %socket.id(), error = %e, "Close frame not sent");
    }
    telemetry.connection_closed(kind);
    debug!(socket = %socket.id(), code = code.as_u16(), "Disconnected");
}

/// Let a reader that has finished closing run to completion, then stop it.
async fn drain_reader(socket: &Socket, mut reader_task: JoinHandle<()>) {
    if timeout(READER_GRACE, &mut reader_task).await.is_err() {
        trace!(socket = %socket.id(), "Reader still blocked, aborting");
        reader_task.abort();
    }
}

async fn read_loop<R: EnvelopeReader>(
    router: Arc<Router>,
    socket: Arc<Socket>,
    mut reader: R,
    telemetry: SharedTelemetry,
) {
    loop {
        match reader.recv().await {
            Ok(Some(envelope)) => {
                telemetry.message_read();
                router.dispatch_client(&socket, envelope).await;
            }
            Ok(None) => {
                trace!(socket = %socket.id(), "Peer closed");
                break;
            }
            Err(e) => {
                if matches!(e, TransportError::Protocol(_)) {
                    telemetry.invalid_json();
                }
                debug!(socket = %socket.id(), error = %e, "Read failed");
                break;
            }
        }
    }
    socket.close().await;
}

async fn write_loop<W: MessageWriter>(
    hub: &Hub,
    socket: &Socket,
    mut mailbox: Mailbox,
    writer: &mut W,
) -> CloseCode {
    let session = &hub.config().session;
    let telemetry = hub.telemetry();
    let mut heartbeat = interval_at(
        Instant::now() + session.heartbeat_interval,
        session.heartbeat_interval,
    );

    loop {
        tokio::select! {
            biased;

            () = hub.wait_for_shutdown() => return CloseCode::GoingAway,
            () = socket.closed() => return CloseCode::Normal,
            message = mailbox.recv() => {
                let Some(message) = message else {
                    return CloseCode::Normal;
                };
                match timeout(session.write_timeout, writer.send(&message)).await {
                    Ok(Ok(())) => telemetry.message_written(),
                    Ok(Err(e)) => {
                        debug!(socket = %socket.id(), error = %e, "Write failed");
                        return CloseCode::Error;
                    }
                    Err(_) => {
                        debug!(socket = %socket.id(), "Write timed out");
                        return CloseCode::Error;
                    }
                }
            }
            _ = heartbeat.tick() => {
                match timeout(session.write_timeout, writer.ping()).await {
                    Ok(Ok(())) => trace!(socket = %socket.id(), "Heartbeat"),
                    Ok(Err(e)) => {
                        debug!(socket = %socket.id(), error = %e, "Heartbeat failed");
                        return CloseCode::Error;
                    }
                    Err(_) => {
                        debug!(socket = %socket.id(), "Heartbeat timed out");
                        return CloseCode::Error;
                    }
                }
            }
        }
    }
}

/// A long-poll request.
#[derive(Debug, Clone, Default)]
pub struct LongPollRequest {
    pub user: String,
    pub page: Option<String>,
    /// A JSON envelope routed as a client command.
    pub command: Option<String>,
}

/// How a long-poll request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongPollOutcome {
    /// One message was written.
    Delivered,
    /// Nothing arrived before the long-poll timeout.
    TimedOut,
    /// The hub is shutting down.
    Shutdown,
    /// The kill-switch is on.
    Disabled,
    /// No identity was supplied.
    Rejected,
    /// The response could not be written.
    Disconnected,
}

/// Serve one long-poll request.
///
/// The future should be run to completion on its own task so the socket is
/// always deregistered, even if the HTTP client goes away.
pub async fn serve_long_poll<W: MessageWriter>(
    hub: Arc<Hub>,
    request: LongPollRequest,
    mut writer: W,
) -> LongPollOutcome {
    if hub.flags().longpoll_disabled() {
        return LongPollOutcome::Disabled;
    }
    if hub.is_shutting_down() {
        return LongPollOutcome::Shutdown;
    }

    let kind = writer.kind();
    let (socket, mut mailbox) = hub.new_socket(kind);
    hub.telemetry().connection_opened(kind);

    let outcome = long_poll(&hub, &socket, &mut mailbox, request, &mut writer).await;

    socket.close().await;
    hub.telemetry().connection_closed(kind);
    debug!(socket = %socket.id(), ?outcome, "Long-poll finished");
    outcome
}

async fn long_poll<W: MessageWriter>(
    hub: &Arc<Hub>,
    socket: &Arc<Socket>,
    mailbox: &mut Mailbox,
    request: LongPollRequest,
    writer: &mut W,
) -> LongPollOutcome {
    if let Err(e) = socket.authenticate_direct(&request.user).await {
        debug!(socket = %socket.id(), error = %e, "Long-poll rejected");
        return LongPollOutcome::Rejected;
    }

    if let Some(page) = request.page.filter(|page| !page.is_empty()) {
        if let Err(e) = socket.set_page(page).await {
            debug!(socket = %socket.id(), error = %e, "Page not applied");
        }
    }

    if let Some(raw) = request.command.filter(|command| !command.is_empty()) {
        hub.telemetry().message_read();
        match decode_envelope(raw.as_bytes()) {
            Ok(envelope) => hub.router().dispatch_client(socket, envelope).await,
            Err(e) => debug!(socket = %socket.id(), error = %e, "Ignoring undecodable command"),
        }
    }

    tokio::select! {
        () = hub.wait_for_shutdown() => LongPollOutcome::Shutdown,
        () = tokio::time::sleep(hub.config().session.longpoll_timeout) => LongPollOutcome::TimedOut,
        message = mailbox.recv() => {
            let Some(message) = message else {
                return LongPollOutcome::Disconnected;
            };
            match writer.send(&message).await {
                Ok(()) => {
                    hub.telemetry().message_written();
                    LongPollOutcome::Delivered
                }
                Err(e) => {
                    debug!(socket = %socket.id(), error = %e, "Long-poll write failed");
                    LongPollOutcome::Disconnected
                }
            }
        }
    }
}
