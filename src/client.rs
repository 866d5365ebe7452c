//! Initiator helpers (§2 item 6, §4.3): connects out to a listening
//! server and drives one send to completion. Thin over [`StreamControl`]
//! — the logic lives there; this module only owns the TCP dial and the
//! device bring-up needed to run as a one-shot client.

use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::connection::{Role, StreamControl};
use crate::device::{DeviceContext, PoolBudget};
use crate::error::Result;
use crate::progress::ProgressHandle;

/// Dials `host:port`, brings up the RDMA connection as [`Role::Sender`],
/// and streams `path` to the peer.
///
/// Opens its own [`DeviceContext`] with an unbounded pool budget, since
/// the client doesn't know its block size until the QP-info exchange
/// tells it what the receiver advertised (§4.3 step 3).
pub fn send_file(host: &str, port: u16, path: &Path, config: &Config) -> Result<()> {
    let (progress, _cancel) = crate::progress::channel();
    send_file_with_progress(host, port, path, config, &progress)
}

/// As [`send_file`], but reports progress and honors cancellation through
/// a caller-supplied [`ProgressHandle`].
pub fn send_file_with_progress(
    host: &str,
    port: u16,
    path: &Path,
    config: &Config,
    progress: &ProgressHandle,
) -> Result<()> {
    let device = Arc::new(DeviceContext::init(
        config.rdma_gid_index,
        1,
        PoolBudget::Unbounded,
    )?);

    let tcp = TcpStream::connect((host, port)).map_err(crate::error::RftpError::Io)?;
    let mut connection = StreamControl::new(device, tcp, Role::Sender, config);

    let outcome = (|| -> Result<()> {
        connection.connect_peer()?;
        connection.post_send_file(path, progress)
    })();

    connection.teardown();
    outcome
}
