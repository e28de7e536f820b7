//! TCP server: an accept thread, one reader thread per connection, and a
//! single dispatcher thread that owns every piece of mutable server state.
//!
//! ```text
//! acceptor ──(new connections)──┐
//!                               ├──> dispatcher ──> disk store
//! readers ───(inbound queue)────┘         │
//!                                         └──> PullData replies on the asking connection
//! ```
//!
//! The connection registry is only ever touched from the dispatcher loop,
//! so it is a plain `HashMap` with no lock around it.

use crate::config::ServerConfig;
use crate::connection::{send_or_stop, CloseReason, Connection, Inbound, Shutdown, Transaction};
use crate::disk::DiskStore;
use crate::error::{Result, SyncError};
use crate::packet::{Message, Packet, PrepareDiskPayload, UpdateDataPayload};
use crate::protocol::{timeouts, LOCAL_SOURCE};
use crate::sync::send_files;
use crate::user_id::UserId;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Results of the accept loop, in accept order
type Accepted = io::Result<TcpStream>;

/// Cheap, cloneable way to talk to a running server from other threads
#[derive(Clone)]
pub struct ServerHandle {
    inbound: Sender<Inbound>,
    shutdown: Shutdown,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Provision a disk root for `user`. Enqueues a PrepareDisk transaction;
    /// the directory is created when the dispatcher gets to it.
    pub fn prepare_disk(&self, disk_size_mib: u64, user: UserId) -> Result<()> {
        let packet = Packet::prepare_disk(user, &PrepareDiskPayload { disk_size_mib });
        let transaction = Transaction {
            packet,
            source: LOCAL_SOURCE.to_string(),
        };
        if send_or_stop(&self.inbound, Inbound::Transaction(transaction), &self.shutdown) {
            Ok(())
        } else {
            Err(SyncError::ServerStopped)
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Dispatcher,
    inbound: Receiver<Inbound>,
}

impl Server {
    /// Validate the config, open the disk store and bind the listener
    pub fn bind(config: ServerConfig, shutdown: Shutdown) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind)?;
        // polled, so the accept loop can observe shutdown
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = bounded(config.max_queued_transactions);
        let dispatcher = Dispatcher::new(config, tx, shutdown)?;

        Ok(Server {
            listener,
            local_addr,
            dispatcher,
            inbound: rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            inbound: self.dispatcher.inbound.clone(),
            shutdown: self.dispatcher.shutdown.clone(),
            local_addr: self.local_addr,
        }
    }

    /// Accept and dispatch until shutdown or a fatal accept error
    pub fn run(self) -> Result<()> {
        let Server {
            listener,
            local_addr,
            mut dispatcher,
            inbound,
        } = self;
        info!(
            addr = %local_addr,
            root = %dispatcher.store.root().display(),
            max_connections = dispatcher.config.max_connections,
            "sdisk server listening"
        );

        let (conn_tx, conn_rx) = bounded(dispatcher.config.max_queued_connections);
        let shutdown = dispatcher.shutdown.clone();
        let acceptor = thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || accept_loop(listener, conn_tx, shutdown))?;

        let result = dispatcher.run(&conn_rx, &inbound);

        dispatcher.shutdown.trigger();
        dispatcher.close_all();
        // unblock an acceptor waiting on a full queue
        drop(conn_rx);
        let _ = acceptor.join();
        info!("sdisk server stopped");
        result
    }
}

fn accept_loop(listener: TcpListener, queue: Sender<Accepted>, shutdown: Shutdown) {
    let poll = Duration::from_millis(timeouts::ACCEPT_POLL_MS);
    while !shutdown.is_triggered() {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "accepted");
                // accepted sockets may inherit the listener's non-blocking mode
                let accepted = stream.set_nonblocking(false).map(|_| stream);
                if !send_or_stop(&queue, accepted, &shutdown) {
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(poll),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                send_or_stop(&queue, Err(e), &shutdown);
                return;
            }
        }
    }
}

/// Owns the connection registry and the disk store; runs on one thread.
pub struct Dispatcher {
    config: ServerConfig,
    store: DiskStore,
    connections: HashMap<String, Connection>,
    /// Cloned into every reader so they all feed the same queue
    inbound: Sender<Inbound>,
    shutdown: Shutdown,
}

impl Dispatcher {
    pub fn new(config: ServerConfig, inbound: Sender<Inbound>, shutdown: Shutdown) -> Result<Self> {
        let store = DiskStore::open(&config.disk_root)?;
        Ok(Dispatcher {
            config,
            store,
            connections: HashMap::new(),
            inbound,
            shutdown,
        })
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn store(&self) -> &DiskStore {
        &self.store
    }

    fn run(&mut self, accepted: &Receiver<Accepted>, inbound: &Receiver<Inbound>) -> Result<()> {
        let tick = Duration::from_millis(timeouts::DISPATCH_TICK_MS);
        loop {
            if self.shutdown.is_triggered() {
                debug!("dispatcher observed shutdown");
                return Ok(());
            }

            select! {
                recv(accepted) -> msg => match msg {
                    Ok(Ok(stream)) => {
                        if let Err(e) = self.add_connection(stream) {
                            warn!(error = %e, "connection rejected");
                        }
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "accept failed, stopping server");
                        return Err(e.into());
                    }
                    // acceptor only exits on shutdown
                    Err(_) => return Ok(()),
                },
                recv(inbound) -> msg => match msg {
                    Ok(Inbound::Transaction(t)) => {
                        if let Err(e) = self.handle_transaction(&t) {
                            warn!(connection = %t.source, user = %t.packet.user(), error = %e, "transaction failed");
                        }
                    }
                    Ok(Inbound::Closed { source, reason }) => self.evict(&source, &reason),
                    Err(_) => return Ok(()),
                },
                default(tick) => {}
            }
        }
    }

    /// Register an accepted socket and start its reader, unless the
    /// registry is already full (the socket is then dropped).
    pub fn add_connection(&mut self, stream: TcpStream) -> Result<()> {
        if self.connections.len() >= self.config.max_connections {
            return Err(SyncError::MaximumClientsReached(self.config.max_connections));
        }

        let mut connection = Connection::new(stream)?;
        connection.set_write_limit(Some(self.config.write_timeout));
        connection.spawn_reader(self.inbound.clone(), self.shutdown.clone(), self.config.read)?;
        info!(
            connection = %connection.id(),
            active = self.connections.len() + 1,
            "client connected"
        );
        self.connections.insert(connection.id().to_string(), connection);
        Ok(())
    }

    fn evict(&mut self, source: &str, reason: &CloseReason) {
        if let Some(mut connection) = self.connections.remove(source) {
            connection.close();
            info!(
                connection = %source,
                reason = %reason,
                active = self.connections.len(),
                "client disconnected"
            );
        }
    }

    fn close_all(&mut self) {
        for (_, mut connection) in self.connections.drain() {
            connection.close();
        }
    }

    /// Route one transaction to its opcode handler
    pub fn handle_transaction(&mut self, t: &Transaction) -> Result<()> {
        let user = t.packet.user();
        match t.packet.message()? {
            Message::PrepareDisk(payload) => self.prepare_disk(user, payload),
            Message::UpdateData(payload) => self.update_data(user, &payload),
            Message::PullData => self.pull_data(user, &t.source),
        }
    }

    fn prepare_disk(&mut self, user: UserId, payload: PrepareDiskPayload) -> Result<()> {
        let root = self.store.prepare(&user)?;
        info!(
            user = %user,
            disk_size_mib = payload.disk_size_mib,
            root = %root.display(),
            "disk prepared"
        );
        Ok(())
    }

    fn update_data(&mut self, user: UserId, payload: &UpdateDataPayload) -> Result<()> {
        let path = self.store.write_chunk(&user, payload)?;
        trace!(
            user = %user,
            path = %path.display(),
            offset = payload.offset,
            len = payload.data.len(),
            "chunk written"
        );
        Ok(())
    }

    fn pull_data(&mut self, user: UserId, source: &str) -> Result<()> {
        let connection = self
            .connections
            .get_mut(source)
            .ok_or_else(|| SyncError::UnknownConnection(source.to_string()))?;
        let files = self.store.files(&user)?;

        match send_files(connection, &files, user, self.config.max_frame_size) {
            Ok(report) => {
                info!(
                    connection = %source,
                    user = %user,
                    files = report.files_sent,
                    chunks = report.chunks_sent,
                    bytes = report.bytes_sent,
                    "pull served"
                );
                Ok(())
            }
            Err(e) => {
                // a half-written frame leaves the stream unusable; close()
                // stops the reader first, so it cannot wait on this thread
                connection.close();
                self.connections.remove(source);
                Err(e)
            }
        }
    }
}
