//! Direct messages over TCP.
//!
//! The server side is one driver task: it waits on the listening socket and on a
//! pending read of every open connection at once, so the number of tasks does not
//! grow with the number of peers. Each connection has its own [`FrameDecoder`], and
//! the messages decoded from it are published in the order they were decoded.
//!
//! The sending side opens a fresh connection per message, writes one frame and
//! closes it.

use futures::stream::{FuturesUnordered, StreamExt};
use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
    sync::{Mutex, Notify},
};

use crate::{
    codec::{self, FrameDecoder},
    config::MessagingSettings,
    events::{ChatEvent, EventBus},
    models::ChatMessage,
    ChatError,
};

const SERVICE: &str = "messaging";

/// Backlog of the listening socket.
const LISTEN_BACKLOG: u32 = 128;

/// An accepted connection and its receive state.
struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    decoder: FrameDecoder<ChatMessage>,
    chunk: Vec<u8>,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr, settings: &MessagingSettings) -> Self {
        Self {
            stream,
            peer,
            decoder: FrameDecoder::new().with_max_frame(settings.max_frame),
            chunk: vec![0; settings.read_chunk_size.max(1)],
        }
    }
}

/// Perform one read on the connection, handing the connection back with the result.
async fn read_once(mut connection: Connection) -> (Connection, io::Result<usize>) {
    let result = connection.stream.read(&mut connection.chunk).await;
    (connection, result)
}

/// Process the outcome of one read.
///
/// Returns the connection if it should stay open.
fn handle_read(
    mut connection: Connection,
    result: io::Result<usize>,
    bus: &EventBus,
) -> Option<Connection> {
    match result {
        Ok(0) => {
            logger::debug!("Connection from {} closed by peer.", connection.peer);
            None
        }
        Ok(size) => {
            let peer = connection.peer;
            for record in connection.decoder.feed(&connection.chunk[..size]) {
                match record {
                    Ok(message) => {
                        logger::debug!("Received message {} from {}.", message.msg_id, peer);
                        bus.publish(ChatEvent::MessageReceived {
                            message,
                            sender: peer,
                        });
                    }
                    Err(err) if err.is_stream_fatal() => {
                        logger::warn!("Closing connection from {}: {}", peer, err);
                        return None;
                    }
                    Err(err) => {
                        logger::warn!("Dropping undecodable frame from {}: {}", peer, err);
                    }
                }
            }
            Some(connection)
        }
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            Some(connection)
        }
        Err(err) => {
            logger::warn!("Failed to read from {}: {}", connection.peer, err);
            None
        }
    }
}

/// The driver loop: accept connections and read from all of them.
async fn drive(
    listener: TcpListener,
    settings: MessagingSettings,
    bus: Arc<EventBus>,
    running: Arc<AtomicBool>,
    terminate: Arc<Notify>,
) {
    let mut reads = FuturesUnordered::new();

    while running.load(Ordering::Acquire) {
        tokio::select! {
            _ = terminate.notified() => {
                logger::debug!("Terminating messaging driver due to termination notification.");
                break;
            },
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    logger::trace!("Accepted connection from {}.", peer);
                    reads.push(read_once(Connection::new(stream, peer, &settings)));
                }
                Err(err) => {
                    if running.load(Ordering::Acquire) {
                        logger::warn!("Failed to accept connection: {}", err);
                    }
                }
            },
            Some((connection, result)) = reads.next(), if !reads.is_empty() => {
                if let Some(connection) = handle_read(connection, result, &bus) {
                    reads.push(read_once(connection));
                }
            },
            // Bounded wait, so that the running flag is polled.
            _ = tokio::time::sleep(settings.poll_interval) => {},
        }
    }

    logger::debug!(
        "Messaging driver exiting; closing {} connection(s).",
        reads.len()
    );
}

/// The tasks of a started service.
struct Running {
    local_addr: SocketAddr,
    driver_handle: tokio::task::JoinHandle<()>,
    terminate: Arc<Notify>,
}

/// Receives direct messages, and sends them.
pub struct MessagingService {
    settings: MessagingSettings,
    bus: Arc<EventBus>,
    running: Arc<AtomicBool>,
    state: Mutex<Option<Running>>,
}

impl MessagingService {
    pub fn new(settings: MessagingSettings, bus: Arc<EventBus>) -> Self {
        Self {
            settings,
            bus,
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &MessagingSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The address the server listens on, if started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.as_ref().map(|running| running.local_addr)
    }

    /// Bind the listening socket and start the driver.
    pub async fn start(&self) -> Result<SocketAddr, ChatError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(ChatError::AlreadyRunning(SERVICE));
        }

        let addr = SocketAddr::new(IpAddr::V4(self.settings.host), self.settings.port);
        let bind_error = |source| ChatError::Bind {
            service: SERVICE,
            addr: addr.to_string(),
            source,
        };

        let socket = TcpSocket::new_v4().map_err(bind_error)?;
        socket.set_reuseaddr(true).map_err(bind_error)?;
        socket.bind(addr).map_err(bind_error)?;
        let listener = socket.listen(LISTEN_BACKLOG).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        self.running.store(true, Ordering::Release);

        let terminate = Arc::new(Notify::new());
        let driver_handle = tokio::spawn(drive(
            listener,
            self.settings.clone(),
            Arc::clone(&self.bus),
            Arc::clone(&self.running),
            Arc::clone(&terminate),
        ));

        logger::info!("Messaging listening on {}.", local_addr);

        *state = Some(Running {
            local_addr,
            driver_handle,
            terminate,
        });
        Ok(local_addr)
    }

    /// Send one message to a peer over a new connection.
    ///
    /// Connecting and writing are each bounded by the send timeout. Failures are
    /// returned for the caller to act upon; the service is unaffected.
    pub async fn send_message(
        &self,
        ip: &str,
        port: u16,
        message: &ChatMessage,
    ) -> Result<usize, ChatError> {
        send_message(ip, port, message, self.settings.send_timeout).await
    }

    /// Stop the driver, closing every open connection.
    ///
    /// Returns `false` if the driver did not exit within the join timeout.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.state.lock().await.take() else {
            return true;
        };

        self.running.store(false, Ordering::Release);
        running.terminate.notify_one();

        let finished =
            match tokio::time::timeout(self.settings.join_timeout, running.driver_handle).await {
                Ok(Ok(())) => true,
                Ok(Err(err)) => {
                    logger::warn!("Messaging driver failed: {}", err);
                    true
                }
                Err(_elapsed) => {
                    logger::warn!("Messaging driver did not exit in time; abandoning it.");
                    false
                }
            };

        logger::info!("Messaging stopped.");
        finished
    }
}

/// Open a connection to `ip:port`, write `message` as one frame, and close.
pub async fn send_message(
    ip: &str,
    port: u16,
    message: &ChatMessage,
    timeout: Duration,
) -> Result<usize, ChatError> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect((ip, port)))
        .await
        .map_err(|_| ChatError::Timeout(timeout, format!("connecting to {ip}:{port}")))?
        .map_err(|err| ChatError::PeerUnreachable(ip.to_owned(), port, err.to_string()))?;

    let written = tokio::time::timeout(timeout, async {
        let written = codec::write_frame(&mut stream, message).await?;
        stream.shutdown().await?;
        Ok::<_, ChatError>(written)
    })
    .await
    .map_err(|_| ChatError::Timeout(timeout, format!("writing to {ip}:{port}")))??;

    logger::debug!(
        "Sent message {} to {}:{} ({} bytes).",
        message.msg_id,
        ip,
        port,
        written
    );
    Ok(written)
}
