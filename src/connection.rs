//! Stream control (§3, §4.3–§4.5): the per-connection object owning one
//! QP, one CQ, an optional completion channel, the buffer pool, and the
//! TCP side channel. Exposes the three operations named in the design:
//! [`StreamControl::connect_peer`], [`StreamControl::post_send_file`],
//! [`StreamControl::post_recv_file`].

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::mem::MaybeUninit;
use std::net::TcpStream;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use rdma::ah::{AddressHandle, GlobalRoute};
use rdma::cc::CompChannel;
use rdma::cq::CompletionQueue;
use rdma::mr::AccessFlags;
use rdma::qp::{self, QueuePair, QueuePairCapacity, QueuePairState, QueuePairType};
use rdma::wr::{self, Opcode};

use crate::config::{Config, StorageSettings};
use crate::device::{MemoryBlock, PoolBudget, SharedDevice};
use crate::error::{Result, RftpError};
use crate::pool::BufferPool;
use crate::progress::ProgressHandle;
use crate::wire::{self, FileInfo, QpInfo};

/// Which side of the connection this [`StreamControl`] plays. The role is
/// implicit in which of [`StreamControl::post_send_file`] /
/// [`StreamControl::post_recv_file`] the caller calls; this field exists
/// only to resolve the one behavior that forks on it during bring-up
/// (§4.3 step 3: who adopts whose block size).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The initiator: connects out, drives `post_send_file`.
    Sender,
    /// The acceptor: was handed an already-connected socket by the
    /// listener, drives `post_recv_file`.
    Receiver,
}

fn full_access_flags() -> AccessFlags {
    AccessFlags::LOCAL_WRITE
        | AccessFlags::REMOTE_READ
        | AccessFlags::REMOTE_WRITE
        | AccessFlags::REMOTE_ATOMIC
}

const RECEIVE_MIN_RNR_TIMER: u8 = 0x12;
const RECEIVE_HOP_LIMIT: u8 = 3;
const RTS_TIMEOUT: u8 = 18;
const RTS_RETRY_CNT: u8 = 7;
const RTS_RNR_RETRY: u8 = 0;

/// A live RDMA connection: one QP, one CQ, the buffer pool carved from
/// one registered memory region, and the TCP side channel used for
/// bring-up and flow control (§3).
pub struct StreamControl {
    device: SharedDevice,
    tcp: TcpStream,
    role: Role,
    block_size_kib: u32,
    block_num: u32,

    qp: Option<QueuePair>,
    cq: Option<CompletionQueue>,
    comp_channel: Option<CompChannel>,
    pool: Option<BufferPool>,
    /// Holds the MR between `bind_memory_region` and `create_buffer_pool`.
    pending_mr: Option<MemoryBlock>,
    local_qp_info: Option<QpInfo>,
    remote_qp_info: Option<QpInfo>,
}

impl StreamControl {
    /// Builds a not-yet-connected stream control for `role` over an
    /// already-established `tcp` socket.
    #[must_use]
    pub fn new(device: SharedDevice, tcp: TcpStream, role: Role, config: &Config) -> Self {
        Self {
            device,
            tcp,
            role,
            block_size_kib: config.block_size_kib,
            block_num: config.block_num,
            qp: None,
            cq: None,
            comp_channel: None,
            pool: None,
            pending_mr: None,
            local_qp_info: None,
            remote_qp_info: None,
        }
    }

    /// Runs the full bring-up sequence (§4.3): QP/CQ/comp-channel
    /// creation, the readiness and QP-info rendezvous, the three QP
    /// modify calls, and memory registration + pool slicing.
    ///
    /// Any failure here tears the connection back down before returning,
    /// so a caller never has to clean up a half-initialized
    /// [`StreamControl`].
    pub fn connect_peer(&mut self) -> Result<()> {
        match self.bring_up_inner() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.teardown();
                Err(err)
            }
        }
    }

    fn bring_up_inner(&mut self) -> Result<()> {
        self.create_lucp_context()?;
        wire::readiness_rendezvous(&mut self.tcp)?;
        self.exchange_qp_info()?;
        self.change_qp_state()?;
        self.bind_memory_region()?;
        self.create_buffer_pool()?;
        Ok(())
    }

    /// Step 1: completion channel, CQ, and RC QP (§4.3).
    fn create_lucp_context(&mut self) -> Result<()> {
        let cc = CompChannel::create(&self.device_ctx())
            .map_err(|err| RftpError::Device(format!("failed to create comp channel: {err}")))?;

        let mut cq_options = CompletionQueue::options();
        cq_options.cqe(self.block_num as usize).channel(&cc);
        let cq = CompletionQueue::create(&self.device_ctx(), cq_options)
            .map_err(|err| RftpError::Device(format!("failed to create CQ: {err}")))?;

        let qp = {
            let cap = QueuePairCapacity {
                max_send_wr: self.block_num as u32,
                max_recv_wr: self.block_num as u32,
                max_send_sge: 1,
                max_recv_sge: 1,
                max_inline_data: 0,
            };
            let mut options = QueuePair::options();
            options
                .send_cq(&cq)
                .recv_cq(&cq)
                .cap(cap)
                .qp_type(QueuePairType::RC)
                .sq_sig_all(true)
                .pd(self.device.pd());
            QueuePair::create(&self.device_ctx(), options)
                .map_err(|err| RftpError::Device(format!("failed to create QP: {err}")))?
        };

        self.local_qp_info = Some(QpInfo {
            lid: self.device.port_attr().lid(),
            qp_num: qp.qp_num(),
            block_num: self.block_num,
            block_size: self.block_size_kib,
            gid: *self.device.gid().as_bytes(),
        });

        self.comp_channel = Some(cc);
        self.cq = Some(cq);
        self.qp = Some(qp);
        Ok(())
    }

    /// Step 3: exchanges `QpInfo`; the sender adopts the receiver's
    /// advertised block size (§4.3 step 3).
    fn exchange_qp_info(&mut self) -> Result<()> {
        let local = self.local_qp_info.expect("populated in create_lucp_context");
        let remote = wire::exchange_qp_info(&mut self.tcp, local)?;
        if self.role == Role::Sender {
            self.block_size_kib = remote.block_size;
        }
        self.remote_qp_info = Some(remote);
        Ok(())
    }

    /// Step 4: the three QP modify calls (§4.3).
    fn change_qp_state(&mut self) -> Result<()> {
        let qp = self.qp.as_ref().expect("created in create_lucp_context");
        let remote = self.remote_qp_info.expect("set in exchange_qp_info");

        {
            let mut options = qp::ModifyOptions::default();
            options
                .qp_state(QueuePairState::Initialize)
                .pkey_index(0)
                .port_num(self.device.port_num())
                .qp_access_flags(full_access_flags());
            qp.modify(options)
                .map_err(|err| RftpError::Device(format!("modify QP to INIT failed: {err}")))?;
        }

        {
            let mut ah_attr = AddressHandle::options();
            ah_attr
                .dest_lid(remote.lid)
                .port_num(self.device.port_num());
            ah_attr.global_route_header(GlobalRoute {
                dest_gid: rdma::device::Gid::from_bytes(remote.gid),
                flow_label: 0,
                sgid_index: self.device.gid_index(),
                hop_limit: RECEIVE_HOP_LIMIT,
                traffic_class: 0,
            });

            let mut options = qp::ModifyOptions::default();
            options
                .qp_state(QueuePairState::ReadyToReceive)
                .path_mtu(self.device.port_attr().active_mtu())
                .dest_qp_num(remote.qp_num)
                .rq_psn(0)
                .max_dest_rd_atomic(1)
                .min_rnr_timer(RECEIVE_MIN_RNR_TIMER)
                .ah_attr(ah_attr);
            qp.modify(options)
                .map_err(|err| RftpError::Device(format!("modify QP to RTR failed: {err}")))?;
        }

        {
            let mut options = qp::ModifyOptions::default();
            options
                .qp_state(QueuePairState::ReadyToSend)
                .timeout(RTS_TIMEOUT)
                .retry_cnt(RTS_RETRY_CNT)
                .rnr_retry(RTS_RNR_RETRY)
                .sq_psn(0)
                .max_rd_atomic(1);
            qp.modify(options)
                .map_err(|err| RftpError::Device(format!("modify QP to RTS failed: {err}")))?;
        }

        Ok(())
    }

    /// Step 5: registers one MR sized `block_size_kib × block_num × 1024`
    /// (§4.3).
    fn bind_memory_region(&mut self) -> Result<()> {
        let length = self.block_size_kib as usize * self.block_num as usize * 1024;
        let mr = self.device.create_mr(length)?;
        self.pending_mr = Some(mr);
        Ok(())
    }

    /// Step 6: slices the freshly-bound MR into the buffer pool (§4.3,
    /// §4.2).
    fn create_buffer_pool(&mut self) -> Result<()> {
        let mr = self
            .pending_mr
            .take()
            .expect("bind_memory_region runs immediately before this");
        let slot_len = self.block_size_kib as usize * 1024;
        self.pool = Some(BufferPool::create(mr, slot_len)?);
        Ok(())
    }

    fn device_ctx(&self) -> &rdma::ctx::Context {
        self.device.raw_ctx()
    }

    /// Tears the connection down (§4.3 teardown): modifies the QP to
    /// RESET before dropping it, then drops the CQ and completion
    /// channel, then returns the MR to the device adapter. Each step is
    /// a no-op if the corresponding resource was never created.
    pub fn teardown(&mut self) {
        if let Some(qp) = self.qp.take() {
            let mut options = qp::ModifyOptions::default();
            options.qp_state(QueuePairState::Reset);
            if let Err(err) = qp.modify(options) {
                log::warn!("failed to modify QP to RESET during teardown: {err}");
            }
            drop(qp);
        }
        self.cq.take();
        self.comp_channel.take();
        if let Some(pool) = self.pool.take() {
            let mr = pool.into_memory_block();
            if let Err(err) = self.device.destroy_mr(mr) {
                log::warn!("failed to return MR to device adapter: {err}");
            }
        }
        if let Some(mr) = self.pending_mr.take() {
            if let Err(err) = self.device.destroy_mr(mr) {
                log::warn!("failed to return MR to device adapter: {err}");
            }
        }
    }

    /// Receive path (§4.4): pre-posts a recv WR into every slot, signals
    /// readiness, reloads configuration to discover the current storage
    /// directory, and streams completions to disk until the advertised
    /// file size has been written.
    ///
    /// `settings_path` is reloaded here, not once at process startup, so
    /// a storage-directory change made between connections takes effect
    /// for every new receive (§4.4 step 3).
    pub fn post_recv_file(
        &mut self,
        settings_path: &Path,
        progress: &ProgressHandle,
    ) -> Result<PathBuf> {
        let pool = self.pool.as_mut().expect("connect_peer must run first");
        let slot_count = pool.len();
        let qp = self.qp.as_ref().expect("connect_peer must run first");

        for slot in 0..slot_count {
            post_recv_slot(qp, pool, slot)?;
        }

        let local_announcement = FileInfo::ready_to_receive();
        let remote_info = wire::exchange_file_info(&mut self.tcp, &local_announcement)?;
        let file_size = remote_info.file_size;

        let storage_dir = StorageSettings::load(settings_path).storage_path;
        let dest_path = storage_dir.join(remote_info.basename());

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o777)
            .open(&dest_path)
            .map_err(|source| RftpError::IoOpen {
                path: dest_path.display().to_string(),
                source,
            })?;

        wire::start_rendezvous(&mut self.tcp)?;

        let mut received: u64 = 0;
        let mut wc_buf = [MaybeUninit::uninit(); 1];

        while received < file_size {
            if progress.is_cancelled() {
                return Err(RftpError::Cancelled);
            }

            let cq = self.cq.as_ref().expect("connect_peer must run first");
            let wcs = cq
                .poll(&mut wc_buf)
                .map_err(|err| RftpError::Device(format!("poll_cq failed: {err}")))?;

            for wc in &mut *wcs {
                if wc.status().is_err() || wc.opcode() != rdma::wc::Opcode::Recv {
                    log::warn!("unexpected completion on receive path: {wc:?}");
                    continue;
                }

                let slot = wc.wr_id() as usize;
                let byte_len = wc.byte_len() as usize;

                let pool = self.pool.as_mut().expect("connect_peer must run first");
                file.write_all(&pool.slot_mut(slot)[..byte_len])
                    .map_err(|source| RftpError::IoTransfer {
                        path: dest_path.display().to_string(),
                        source,
                    })?;

                let qp = self.qp.as_ref().expect("connect_peer must run first");
                post_recv_slot(qp, pool, slot)?;

                if let Err(err) = wire::send_ack_nonblocking(&self.tcp) {
                    log::warn!("failed to send receive-credit ack: {err}");
                }

                received += byte_len as u64;
                progress.report(received, file_size);
            }
        }

        Ok(dest_path)
    }

    /// Send path (§4.5): announces the file, waits for the receiver's
    /// readiness token, then runs the credit-controlled pipelining loop
    /// until every byte has been posted and every send has completed.
    pub fn post_send_file(&mut self, path: &Path, progress: &ProgressHandle) -> Result<()> {
        let file_size = path
            .metadata()
            .map_err(|_| RftpError::FileNotFound(path.display().to_string()))?
            .len();

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let announcement = FileInfo::announce(&name, file_size);
        let remote_info = wire::exchange_file_info(&mut self.tcp, &announcement)?;
        if !remote_info.is_ready_to_receive() {
            return Err(RftpError::NotReady(format!(
                "receiver answered {:?} instead of READY_TO_RECEIVE",
                remote_info.file_name
            )));
        }

        wire::start_rendezvous(&mut self.tcp)?;

        let mut file = File::open(path).map_err(|source| RftpError::IoOpen {
            path: path.display().to_string(),
            source,
        })?;

        let pool_size = self.pool.as_ref().expect("connect_peer must run first").len();
        let mut remaining_recv_credits = self
            .remote_qp_info
            .expect("connect_peer must run first")
            .block_num as i64;
        let mut outstanding: usize = 0;
        let mut bytes_left = file_size;
        let mut slot_index = 0usize;

        let mut wc_buf_storage: Vec<MaybeUninit<rdma::wc::WorkCompletion>> =
            (0..pool_size).map(|_| MaybeUninit::uninit()).collect();

        while bytes_left > 0 || outstanding > 0 {
            if progress.is_cancelled() {
                return Err(RftpError::Cancelled);
            }

            remaining_recv_credits += drain_acks(&mut self.tcp)?;

            if remaining_recv_credits > 0 && bytes_left > 0 {
                if progress.is_cancelled() {
                    return Err(RftpError::Cancelled);
                }

                let pool = self.pool.as_mut().expect("connect_peer must run first");
                let slot = slot_index % pool_size;
                let slot_cap = pool.slot_len(slot) as u64;
                let to_read = slot_cap.min(bytes_left) as usize;

                file.read_exact(&mut pool.slot_mut(slot)[..to_read])
                    .map_err(|source| RftpError::IoTransfer {
                        path: path.display().to_string(),
                        source,
                    })?;

                let qp = self.qp.as_ref().expect("connect_peer must run first");
                post_send_slot(qp, pool, slot, to_read)?;

                remaining_recv_credits -= 1;
                outstanding += 1;
                bytes_left -= to_read as u64;
                slot_index += 1;
                progress.report(file_size - bytes_left, file_size);
            }

            let need_more_drain = |outstanding: usize| outstanding >= pool_size && bytes_left > 0
                || bytes_left == 0 && outstanding > 0;

            while need_more_drain(outstanding) {
                let cq = self.cq.as_ref().expect("connect_peer must run first");
                let wcs = cq
                    .poll(&mut wc_buf_storage)
                    .map_err(|err| RftpError::Device(format!("poll_cq failed: {err}")))?;
                if wcs.is_empty() {
                    continue;
                }
                for wc in &mut *wcs {
                    wc.status().map_err(|err| {
                        RftpError::WorkCompletionError(format!("send WR failed: {err}"))
                    })?;
                    outstanding -= 1;
                }
            }
        }

        Ok(())
    }
}

/// Posts one recv WR into `slot`, tagged with `slot` as the WR ID.
fn post_recv_slot(qp: &QueuePair, pool: &mut BufferPool, slot: usize) -> Result<()> {
    let mut sge = wr::Sge {
        addr: pool.slot_addr(slot),
        length: pool.slot_len(slot) as u32,
        lkey: pool.lkey(),
    };
    let mut recv_wr = wr::RecvRequest::zeroed();
    recv_wr.id(slot as u64).sg_list(std::slice::from_mut(&mut sge));
    unsafe { qp.post_recv(&mut recv_wr) }
        .map_err(|err| RftpError::Device(format!("post_recv failed: {err}")))
}

/// Posts one signaled SEND WR from `slot`'s first `len` bytes, tagged
/// with `slot` as the WR ID.
fn post_send_slot(qp: &QueuePair, pool: &mut BufferPool, slot: usize, len: usize) -> Result<()> {
    let mut sge = wr::Sge {
        addr: pool.slot_addr(slot),
        length: len as u32,
        lkey: pool.lkey(),
    };
    let mut send_wr = wr::SendRequest::zeroed();
    send_wr
        .id(slot as u64)
        .sg_list(std::slice::from_mut(&mut sge))
        .opcode(Opcode::Send);
    unsafe { qp.post_send(&mut send_wr) }
        .map_err(|err| RftpError::Device(format!("post_send failed: {err}")))
}

/// Non-blocking drain of pending receive-credit acks (§4.5): every byte
/// read must be `'A'`; returns the number of fresh credits gained.
fn drain_acks(tcp: &mut TcpStream) -> Result<i64> {
    tcp.set_nonblocking(true)
        .map_err(|err| RftpError::SyncFailure(format!("set_nonblocking failed: {err}")))?;

    let mut credits = 0i64;
    let mut buf = [0u8; 256];
    let result = loop {
        match tcp.read(&mut buf) {
            Ok(0) => break Err(RftpError::PeerClosed),
            Ok(n) => {
                if let Some(bad) = buf[..n].iter().find(|&&b| b != b'A') {
                    break Err(RftpError::SyncFailure(format!(
                        "unexpected byte {bad:#x} on ack channel"
                    )));
                }
                credits += n as i64;
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => break Ok(credits),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => break Err(RftpError::Io(err)),
        }
    };

    let _ = tcp.set_nonblocking(false);
    result
}
