//! The TCP side-channel wire formats exchanged during bring-up (§3, §6).
//!
//! Everything here is hand-packed rather than derived: the layout is part
//! of the protocol, not an implementation detail, so it is written out
//! byte-by-byte instead of relying on a generic serializer whose encoding
//! could change across crate versions.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use crate::error::{Result, RftpError};

/// Size in bytes of the `QpInfo` wire encoding.
pub const QP_INFO_WIRE_LEN: usize = 2 + 4 + 4 + 4 + 16;

/// Size in bytes of the `FileInfo` wire encoding.
pub const FILE_INFO_WIRE_LEN: usize = 256 + 8;

const FILE_PATH_LEN: usize = 256;

/// The literal token a receiver sends in place of a real file name to
/// signal "I am ready to receive" (§3, §4.4).
pub const READY_TO_RECEIVE: &str = "READY_TO_RECEIVE";

/// Queue-pair bring-up parameters exchanged once per connection (§3).
///
/// Multi-byte integers go over the wire in network byte order; the GID is
/// copied through as opaque bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInfo {
    /// Local identifier of the port.
    pub lid: u16,
    /// Queue-pair number.
    pub qp_num: u32,
    /// Receive-side slot count (the sender's recv-credit budget).
    pub block_num: u32,
    /// Slot size in KiB.
    pub block_size: u32,
    /// 128-bit global identifier, opaque bytes.
    pub gid: [u8; 16],
}

impl QpInfo {
    /// Encodes `self` into the wire layout.
    #[must_use]
    pub fn to_bytes(self) -> [u8; QP_INFO_WIRE_LEN] {
        let mut buf = [0u8; QP_INFO_WIRE_LEN];
        let mut offset = 0;
        buf[offset..offset + 2].copy_from_slice(&self.lid.to_be_bytes());
        offset += 2;
        buf[offset..offset + 4].copy_from_slice(&self.qp_num.to_be_bytes());
        offset += 4;
        buf[offset..offset + 4].copy_from_slice(&self.block_num.to_be_bytes());
        offset += 4;
        buf[offset..offset + 4].copy_from_slice(&self.block_size.to_be_bytes());
        offset += 4;
        buf[offset..offset + 16].copy_from_slice(&self.gid);
        buf
    }

    /// Decodes `self` from the wire layout.
    #[must_use]
    pub fn from_bytes(buf: &[u8; QP_INFO_WIRE_LEN]) -> Self {
        let mut offset = 0;
        let lid = u16::from_be_bytes(buf[offset..offset + 2].try_into().unwrap());
        offset += 2;
        let qp_num = u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap());
        offset += 4;
        let block_num = u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap());
        offset += 4;
        let block_size = u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap());
        offset += 4;
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[offset..offset + 16]);
        Self {
            lid,
            qp_num,
            block_num,
            block_size,
            gid,
        }
    }
}

/// The one-shot file announcement exchanged right after the QP reaches
/// RTS (§3, §4.4, §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// NUL-padded UTF-8 file name (basename only), or [`READY_TO_RECEIVE`].
    pub file_name: String,
    /// Byte length of the file; `0` when sent by a receiver.
    pub file_size: u64,
}

impl FileInfo {
    /// Builds the `READY_TO_RECEIVE` announcement a receiver sends.
    #[must_use]
    pub fn ready_to_receive() -> Self {
        Self {
            file_name: READY_TO_RECEIVE.to_owned(),
            file_size: 0,
        }
    }

    /// Builds the announcement a sender makes for `name`/`size`.
    #[must_use]
    pub fn announce(name: &str, size: u64) -> Self {
        Self {
            file_name: name.to_owned(),
            file_size: size,
        }
    }

    /// True when this announcement is the receiver's readiness token.
    #[must_use]
    pub fn is_ready_to_receive(&self) -> bool {
        self.file_name == READY_TO_RECEIVE
    }

    /// Encodes `self` into the wire layout. `file_size` is written in
    /// native byte order, matching the documented wire quirk (§3): both
    /// peers in this system are built from the same source, so the
    /// asymmetry with `QpInfo`'s network-order integers is harmless as
    /// long as it is consistent.
    pub fn to_bytes(&self) -> Result<[u8; FILE_INFO_WIRE_LEN]> {
        let name_bytes = self.file_name.as_bytes();
        if name_bytes.len() >= FILE_PATH_LEN {
            return Err(RftpError::SyncFailure(format!(
                "file name {} bytes too long for the {} byte wire field",
                name_bytes.len(),
                FILE_PATH_LEN
            )));
        }
        let mut buf = [0u8; FILE_INFO_WIRE_LEN];
        buf[..name_bytes.len()].copy_from_slice(name_bytes);
        buf[FILE_PATH_LEN..].copy_from_slice(&self.file_size.to_ne_bytes());
        Ok(buf)
    }

    /// Decodes `self` from the wire layout.
    pub fn from_bytes(buf: &[u8; FILE_INFO_WIRE_LEN]) -> Result<Self> {
        let name_end = buf[..FILE_PATH_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILE_PATH_LEN);
        let file_name = std::str::from_utf8(&buf[..name_end])
            .map_err(|err| RftpError::SyncFailure(format!("non-utf8 file name: {err}")))?
            .to_owned();
        let file_size = u64::from_ne_bytes(buf[FILE_PATH_LEN..].try_into().unwrap());
        Ok(Self {
            file_name,
            file_size,
        })
    }

    /// Strips any path separators from [`FileInfo::file_name`], keeping
    /// only the final component (§9: a malicious sender must not be able
    /// to steer a write outside the configured storage directory).
    #[must_use]
    pub fn basename(&self) -> String {
        std::path::Path::new(&self.file_name)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file_name.clone())
    }
}

/// Blocking, fixed-length rendezvous used at each bring-up step (§4.3
/// steps 2–3, and the start-byte at step 4 of the send/recv paths).
///
/// Both directions are driven here: the local byte(s) are written first,
/// then the peer's are read. A short read or write on either leg is
/// reported as [`RftpError::SyncFailure`].
pub fn sock_sync_data(stream: &mut TcpStream, local: &[u8], remote_len: usize) -> Result<Vec<u8>> {
    stream
        .write_all(local)
        .map_err(|err| RftpError::SyncFailure(format!("short write: {err}")))?;

    let mut remote = vec![0u8; remote_len];
    stream
        .read_exact(&mut remote)
        .map_err(|err| RftpError::SyncFailure(format!("short read: {err}")))?;
    Ok(remote)
}

/// Sends the one-byte readiness token `'R'` and expects it back (§4.3 step 2).
pub fn readiness_rendezvous(stream: &mut TcpStream) -> Result<()> {
    let remote = sock_sync_data(stream, b"R", 1)?;
    if remote[0] != b'R' {
        return Err(RftpError::NotReady(
            "peer did not answer the readiness byte with 'R'".to_owned(),
        ));
    }
    Ok(())
}

/// Sends the one-byte start token `'Y'` and expects it back (§4.4 step 5,
/// §4.5 step 4).
pub fn start_rendezvous(stream: &mut TcpStream) -> Result<()> {
    let remote = sock_sync_data(stream, b"Y", 1)?;
    if remote[0] != b'Y' {
        return Err(RftpError::SyncFailure(
            "peer did not answer the start byte with 'Y'".to_owned(),
        ));
    }
    Ok(())
}

/// Exchanges `QpInfo` over `stream` (§4.3 step 3).
pub fn exchange_qp_info(stream: &mut TcpStream, local: QpInfo) -> Result<QpInfo> {
    let remote = sock_sync_data(stream, &local.to_bytes(), QP_INFO_WIRE_LEN)?;
    let remote: [u8; QP_INFO_WIRE_LEN] = remote.try_into().unwrap();
    Ok(QpInfo::from_bytes(&remote))
}

/// Exchanges `FileInfo` over `stream` (§4.4 step 2, §4.5 step 2).
pub fn exchange_file_info(stream: &mut TcpStream, local: &FileInfo) -> Result<FileInfo> {
    let remote = sock_sync_data(stream, &local.to_bytes()?, FILE_INFO_WIRE_LEN)?;
    let remote: [u8; FILE_INFO_WIRE_LEN] = remote.try_into().unwrap();
    FileInfo::from_bytes(&remote)
}

/// Sends a single receive-credit ack byte (`'A'`) non-blockingly (§4.4
/// step 6). Errors here are reported to the caller, which is expected to
/// treat a failed ack-send as fatal for the connection.
pub fn send_ack_nonblocking(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    let result = (&*stream).write_all(b"A");
    stream.set_nonblocking(false)?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qp_info_round_trips() {
        let info = QpInfo {
            lid: 0x1234,
            qp_num: 0xdead_beef,
            block_num: 16,
            block_size: 64,
            gid: [7u8; 16],
        };
        assert_eq!(QpInfo::from_bytes(&info.to_bytes()), info);
    }

    #[test]
    fn file_info_round_trips_and_pads_with_nul() {
        let info = FileInfo::announce("report.pdf", 12345);
        let bytes = info.to_bytes().unwrap();
        assert_eq!(bytes[10], 0, "name field must be NUL-padded after the name");
        let decoded = FileInfo::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn ready_to_receive_round_trips() {
        let info = FileInfo::ready_to_receive();
        let bytes = info.to_bytes().unwrap();
        let decoded = FileInfo::from_bytes(&bytes).unwrap();
        assert!(decoded.is_ready_to_receive());
    }

    #[test]
    fn basename_strips_path_components() {
        let info = FileInfo::announce("../../etc/passwd", 1);
        assert_eq!(info.basename(), "passwd");
    }

    #[test]
    fn oversized_name_is_rejected() {
        let info = FileInfo::announce(&"x".repeat(300), 1);
        assert!(info.to_bytes().is_err());
    }
}
