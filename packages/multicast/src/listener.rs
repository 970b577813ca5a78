//! A listener task bound to a single UDP socket.
//!
//! The listener owns the socket (and its multicast membership, if any). Every
//! datagram received is wrapped into a [`Datagram`] and handed to the handler
//! given to [`DatagramListener::start`]; what the payload means is up to the
//! handler.

use crate::{datagram::Datagram, logger, socket::*};
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::Notify;

/// The default packet size for receiving datagrams.
///
/// Any datagram larger than this size will be truncated, and likely result in
/// an error when deserializing the payload. This is the largest UDP payload.
pub const DEFAULT_PACKET_SIZE: usize = 65535;

/// The default interval after which a blocked receive returns to check whether
/// the listener should keep running.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A socket and the task that receives from it.
///
/// To create a new [`DatagramListener`], use one of the `bind*` constructors; the
/// socket is bound immediately, so that a bind failure is reported to the caller
/// before anything is spawned. To start receiving, call [`Self::start`]. To stop,
/// call [`Self::stop`], which also drops the multicast membership before the socket
/// is closed. Dropping the listener signals the task to terminate as well.
pub struct DatagramListener {
    /// The socket used to receive datagrams.
    socket: Arc<AsyncSocket>,

    /// The multicast group this socket is a member of.
    membership: Option<SocketAddr>,

    /// Whether [`Self::membership`] is still in effect.
    member: AtomicBool,

    /// The maximum size of a packet that can be received.
    packet_size: usize,

    /// The longest a single receive may block before the running flag is polled.
    poll_interval: Duration,

    /// A flag polled by the task on every iteration.
    running: Arc<AtomicBool>,

    /// The handle of the receiving task.
    listener_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,

    /// A flag to indicate if the task should terminate.
    _terminate_flag: Arc<Notify>,
}

impl DatagramListener {
    /// Creates a listener on a socket bound to the given address.
    pub fn bind(addr: &SocketAddr) -> io::Result<Self> {
        Ok(Self::from_socket(create_udp(addr)?, None))
    }

    /// Creates a listener on a broadcast enabled socket bound to all interfaces.
    pub fn bind_broadcast(port: u16) -> io::Result<Self> {
        Ok(Self::from_socket(create_broadcast(port)?, None))
    }

    /// Creates a listener that is a member of the given multicast group.
    pub fn bind_multicast(group: &SocketAddr) -> io::Result<Self> {
        Ok(Self::from_socket(
            create_multicast_receiver(group)?,
            Some(*group),
        ))
    }

    fn from_socket(socket: AsyncSocket, membership: Option<SocketAddr>) -> Self {
        Self {
            socket: Arc::new(socket),
            member: AtomicBool::new(membership.is_some()),
            membership,
            packet_size: DEFAULT_PACKET_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            running: Arc::new(AtomicBool::new(false)),
            listener_handle: Mutex::new(None),
            _terminate_flag: Arc::new(Notify::new()),
        }
    }

    /// Sets the maximum size of a packet that can be received.
    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Sets the longest a single receive may block.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The socket this listener receives from.
    ///
    /// The socket can also be used to send; the discovery channel sends its
    /// heartbeats through the very socket it listens on.
    pub fn socket(&self) -> Arc<AsyncSocket> {
        Arc::clone(&self.socket)
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .get_ref()
            .local_addr()?
            .as_socket()
            .ok_or_else(|| crate::build_error("Socket is not bound to an IP address."))
    }

    /// The multicast group this listener joined, if any.
    pub fn membership(&self) -> Option<SocketAddr> {
        self.membership
    }

    /// Starts receiving on the socket, handing every datagram to `handler`.
    ///
    /// Returns `false` without doing anything if the listener is already running.
    /// This must be called from within a tokio runtime.
    pub fn start<F>(&self, handler: F) -> bool
    where
        F: Fn(Datagram) + Send + Sync + 'static,
    {
        let mut guard = match self.listener_handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if guard.is_some() {
            logger::warn!("Listener is already running; ignoring start request.");
            return false;
        }

        self.running.store(true, Ordering::Release);

        let socket = Arc::clone(&self.socket);
        let running = Arc::clone(&self.running);
        let terminate = Arc::clone(&self._terminate_flag);
        let packet_size = self.packet_size;
        let poll_interval = self.poll_interval;

        *guard = Some(tokio::spawn(async move {
            while running.load(Ordering::Acquire) {
                tokio::select! {
                    _ = terminate.notified() => {
                        logger::info!("Terminating listener due to termination notification.");
                        break;
                    },
                    received = tokio::time::timeout(poll_interval, receive_datagram(&socket, packet_size)) => {
                        match received {
                            // Nothing arrived; poll the running flag again.
                            Err(_elapsed) => continue,
                            Ok(Ok((payload, sock_addr))) => match sock_addr.as_socket() {
                                Some(sender) => handler(Datagram::new(payload, sender)),
                                None => logger::warn!(
                                    "Dropping datagram from unknown source {}.",
                                    describe_sock_addr(&sock_addr)
                                ),
                            },
                            Ok(Err(err)) => {
                                // Errors after a stop request are expected.
                                if running.load(Ordering::Acquire) {
                                    logger::warn!("Failed to receive datagram: {}", err);
                                }
                            }
                        }
                    },
                }
            }
            logger::debug!("Listener task exited.");
        }));

        true
    }

    /// Check if the listener task has been started and not yet stopped.
    pub fn is_listening(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops receiving, and drops the multicast membership if there is one.
    ///
    /// The task is given `wait` to exit; if it does not, it is left to finish on its
    /// own and this returns `false`.
    pub async fn stop(&self, wait: Duration) -> bool {
        logger::debug!("Stopping listener...");
        self.signal_stop();

        let handle = match self.listener_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let finished = match handle {
            Some(handle) => match tokio::time::timeout(wait, handle).await {
                Ok(Ok(())) => true,
                Ok(Err(err)) => {
                    logger::warn!("Listener task failed: {}", err);
                    true
                }
                Err(_elapsed) => {
                    logger::warn!(
                        "Listener task did not exit within {:?}; abandoning it.",
                        wait
                    );
                    false
                }
            },
            None => true,
        };

        self.leave();
        finished
    }

    /// Drop the multicast membership, once.
    fn leave(&self) {
        if let Some(group) = self.membership {
            if self.member.swap(false, Ordering::AcqRel) {
                if let Err(err) = leave_multicast(&self.socket, &group) {
                    logger::warn!(
                        "Failed to leave multicast group {}: {}",
                        describe_socket_addr(&group),
                        err
                    );
                }
            }
        }
    }

    fn signal_stop(&self) {
        self.running.store(false, Ordering::Release);
        self._terminate_flag.notify_one();
    }
}

impl Drop for DatagramListener {
    fn drop(&mut self) {
        logger::debug!("Drop triggered on DatagramListener.");
        self.signal_stop();
        self.leave();
    }
}
