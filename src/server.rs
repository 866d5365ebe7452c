//! Listener and per-client handler (§4.6): accepts TCP connections,
//! admits at most `max_thread_num` concurrent clients, and runs the full
//! receiver flow on a detached thread per client.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::config::Config;
use crate::connection::{Role, StreamControl};
use crate::device::SharedDevice;
use crate::progress;

/// Where a client's receive currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientStatus {
    /// Connected but not yet streaming a file.
    Idle,
    /// Mid-transfer.
    Receiving {
        /// Destination file name.
        name: String,
        /// Total bytes expected.
        total: u64,
        /// Bytes written so far.
        received: u64,
    },
}

/// One entry in the server's client table (§3).
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Peer address, for logging and diagnostics.
    pub peer_ip: IpAddr,
    /// Current substate.
    pub status: ClientStatus,
}

/// The server-side admission table: a map from TCP file descriptor to
/// [`ClientRecord`], guarded by a mutex held only during insertion,
/// removal, and size inspection (§5).
#[derive(Default)]
pub struct ClientTable {
    clients: Mutex<HashMap<RawFd, ClientRecord>>,
}

impl ClientTable {
    /// Builds an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of clients currently admitted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    /// True when no clients are admitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    fn insert(&self, fd: RawFd, peer_ip: IpAddr) {
        self.clients.lock().insert(
            fd,
            ClientRecord {
                peer_ip,
                status: ClientStatus::Idle,
            },
        );
    }

    fn remove(&self, fd: RawFd) {
        self.clients.lock().remove(&fd);
    }

    fn set_status(&self, fd: RawFd, status: ClientStatus) {
        if let Some(record) = self.clients.lock().get_mut(&fd) {
            record.status = status;
        }
    }
}

/// Runs the accept loop forever: binds `SO_REUSEADDR` on `config.listen_port`
/// with a backlog equal to `max_thread_num`, then spawns one detached
/// handler thread per admitted client (§4.6).
///
/// `settings_path` is the storage-settings file each handler reloads
/// before writing a file (§4.4 step 3); `device` is the process-wide
/// device context every connection shares.
pub fn serve(
    device: SharedDevice,
    config: Arc<Config>,
    settings_path: PathBuf,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = bind_reuseaddr(addr, config.max_thread_num as i32)?;
    let table = Arc::new(ClientTable::new());

    log::info!(
        "listening on {addr} (max_thread_num={})",
        config.max_thread_num
    );

    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(stream) => stream,
            Err(err) => {
                log::warn!("accept failed: {err}");
                continue;
            }
        };

        if table.len() >= config.max_thread_num as usize {
            log::warn!(
                "rejecting connection from {:?}: at admission cap ({})",
                stream.peer_addr(),
                config.max_thread_num
            );
            drop(stream);
            continue;
        }

        let fd = stream.as_raw_fd();
        let peer_ip = stream
            .peer_addr()
            .map(|addr| addr.ip())
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));
        table.insert(fd, peer_ip);

        let device = Arc::clone(&device);
        let config = Arc::clone(&config);
        let table = Arc::clone(&table);
        let settings_path = settings_path.clone();

        thread::spawn(move || {
            handle_client(stream, fd, device, config, table.clone(), settings_path);
            table.remove(fd);
        });
    }

    Ok(())
}

fn bind_reuseaddr(addr: SocketAddr, backlog: i32) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

fn handle_client(
    stream: TcpStream,
    fd: RawFd,
    device: SharedDevice,
    config: Arc<Config>,
    table: Arc<ClientTable>,
    settings_path: PathBuf,
) {
    let peer = stream.peer_addr().ok();
    log::info!("accepted connection from {peer:?}");

    let mut connection = StreamControl::new(device, stream, Role::Receiver, &config);
    let (progress_handle, _cancel_token) = progress::channel();

    let outcome = (|| -> crate::error::Result<()> {
        connection.connect_peer()?;
        table.set_status(
            fd,
            ClientStatus::Receiving {
                name: String::new(),
                total: 0,
                received: 0,
            },
        );
        let dest = connection.post_recv_file(&settings_path, &progress_handle)?;
        log::info!("received file from {peer:?} into {}", dest.display());
        Ok(())
    })();

    if let Err(err) = outcome {
        log::warn!("receive from {peer:?} failed: {err}");
    }

    connection.teardown();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(octet: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, octet])
    }

    #[test]
    fn starts_empty() {
        let table = ClientTable::new();
        assert_eq!(table.len(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn insert_and_remove_track_len() {
        let table = ClientTable::new();
        table.insert(1, ip(1));
        table.insert(2, ip(2));
        assert_eq!(table.len(), 2);
        assert!(!table.is_empty());

        table.remove(1);
        assert_eq!(table.len(), 1);

        table.remove(2);
        assert!(table.is_empty());
    }

    #[test]
    fn remove_of_unknown_fd_is_a_no_op() {
        let table = ClientTable::new();
        table.insert(1, ip(1));
        table.remove(99);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn set_status_updates_an_admitted_client() {
        let table = ClientTable::new();
        table.insert(1, ip(1));
        table.set_status(
            1,
            ClientStatus::Receiving {
                name: "report.pdf".to_owned(),
                total: 100,
                received: 40,
            },
        );
        let status = table.clients.lock().get(&1).unwrap().status.clone();
        assert_eq!(
            status,
            ClientStatus::Receiving {
                name: "report.pdf".to_owned(),
                total: 100,
                received: 40,
            }
        );
    }

    #[test]
    fn set_status_on_unknown_fd_is_a_no_op() {
        let table = ClientTable::new();
        table.set_status(7, ClientStatus::Idle);
        assert!(table.is_empty());
    }
}
