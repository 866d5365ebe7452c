//! Device adapter (§3, §4.1): opens the RDMA device, owns the single
//! process-wide protection domain, and tracks every pinned memory region
//! registered against it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rdma::ctx::Context;
use rdma::device::{Device, DeviceList, Gid, GidEntry, PortAttr};
use rdma::mr::{AccessFlags, MemoryRegion};
use rdma::pd::ProtectionDomain;

use crate::error::{Result, RftpError};

/// How many bytes a [`DeviceContext`] is willing to register in total.
///
/// `Unbounded` is the client-side sentinel (§4.1): the first [`DeviceContext::create_mr`]
/// call adopts its own length as the budget, so an initiator can size its
/// pool lazily from the receiver's advertised block size.
#[derive(Debug, Clone, Copy)]
pub enum PoolBudget {
    /// A fixed, pre-declared number of bytes (server side, from config).
    Bounded(usize),
    /// No budget yet; the first registration sets it.
    Unbounded,
}

struct Registry {
    /// Live MRs keyed by the start address of their backing buffer.
    live: HashMap<usize, usize>,
    free_bytes: Option<usize>,
}

/// One opened RDMA device, its protection domain, and its MR registry.
///
/// Exactly one of these exists per process (§3). The protection domain
/// and every MR it ever registers are torn down only when this value is
/// dropped, which happens at process exit.
pub struct DeviceContext {
    ctx: Context,
    pd: ProtectionDomain,
    port_num: u8,
    port_attr: PortAttr,
    gid: Gid,
    gid_index: u32,
    registry: Mutex<Registry>,
}

/// A pinned, registered buffer handed back by [`DeviceContext::create_mr`].
pub struct MemoryBlock {
    buffer: Box<[u8]>,
    region: MemoryRegion,
}

impl MemoryBlock {
    /// Start address of the backing buffer; the registry key.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.buffer.as_ptr() as usize
    }

    /// Length in bytes of the backing buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Raw pointer to the backing buffer, for slicing into pool slots.
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buffer.as_mut_ptr()
    }

    /// The local key used when building work-request SGEs.
    #[must_use]
    pub fn lkey(&self) -> u32 {
        self.region.lkey()
    }
}

impl DeviceContext {
    /// Enumerates devices, opens the first whose `port_num` query
    /// succeeds, queries its attributes and the GID at `gid_index`, and
    /// allocates the process-wide protection domain (§4.1).
    pub fn init(gid_index: u32, port_num: u8, pool_budget: PoolBudget) -> Result<Self> {
        let dev_list = DeviceList::available()
            .map_err(|err| RftpError::Device(format!("failed to list devices: {err}")))?;
        if dev_list.is_empty() {
            return Err(RftpError::Device("no RDMA devices present".to_owned()));
        }

        let (ctx, port_attr) = open_first_usable(&dev_list, port_num)?;

        let gid_entry = GidEntry::query(&ctx, port_num.into(), gid_index)
            .map_err(|err| RftpError::Device(format!("failed to query GID: {err}")))?;
        let gid = gid_entry.gid();

        let pd = ProtectionDomain::alloc(&ctx)
            .map_err(|err| RftpError::Device(format!("failed to allocate PD: {err}")))?;

        let free_bytes = match pool_budget {
            PoolBudget::Bounded(bytes) => Some(bytes),
            PoolBudget::Unbounded => None,
        };

        Ok(Self {
            ctx,
            pd,
            port_num,
            port_attr,
            gid,
            gid_index,
            registry: Mutex::new(Registry {
                live: HashMap::new(),
                free_bytes,
            }),
        })
    }

    /// The port number this device was opened against.
    #[must_use]
    pub fn port_num(&self) -> u8 {
        self.port_num
    }

    /// The GID selected at `gid_index` during [`DeviceContext::init`].
    #[must_use]
    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// The configured GID table index.
    #[must_use]
    pub fn gid_index(&self) -> u32 {
        self.gid_index
    }

    /// The queried port attributes (LID, active MTU, link layer, state).
    #[must_use]
    pub fn port_attr(&self) -> &PortAttr {
        &self.port_attr
    }

    /// The process-wide protection domain.
    #[must_use]
    pub fn pd(&self) -> &ProtectionDomain {
        &self.pd
    }

    /// The raw device context, for calls (CQ/QP/comp-channel creation)
    /// that take it directly rather than through a higher-level handle.
    #[must_use]
    pub fn raw_ctx(&self) -> &Context {
        &self.ctx
    }

    /// Registers a new `length`-byte memory region (§4.1).
    ///
    /// Fails with [`RftpError::ResourceExhausted`] when `length` exceeds
    /// the current free-byte budget, and with [`RftpError::Device`] when
    /// `length == 0` or the buffer cannot be allocated or registered. On
    /// success, `free_bytes` is debited by `length` and the registry gains
    /// an entry keyed by the buffer's start address.
    pub fn create_mr(&self, length: usize) -> Result<MemoryBlock> {
        if length == 0 {
            return Err(RftpError::Device(
                "create_mr called with length 0".to_owned(),
            ));
        }

        let mut registry = self.registry.lock();
        let free_bytes = match registry.free_bytes {
            Some(free) if length > free => {
                return Err(RftpError::ResourceExhausted {
                    requested: length,
                    free,
                });
            }
            Some(free) => free,
            // Unbounded sentinel: the first call adopts `length` as the budget.
            None => length,
        };

        let mut buffer: Box<[u8]> = vec![0u8; length].into_boxed_slice();
        let access = AccessFlags::LOCAL_WRITE
            | AccessFlags::REMOTE_READ
            | AccessFlags::REMOTE_WRITE
            | AccessFlags::REMOTE_ATOMIC;
        let region = unsafe {
            MemoryRegion::register(&self.pd, buffer.as_mut_ptr(), buffer.len(), access)
                .map_err(|err| RftpError::Device(format!("failed to register MR: {err}")))?
        };

        let addr = buffer.as_ptr() as usize;
        registry.live.insert(addr, length);
        registry.free_bytes = Some(free_bytes - length);

        Ok(MemoryBlock { buffer, region })
    }

    /// Deregisters `block`, freeing its backing buffer and crediting its
    /// length back to the free-byte budget (§4.1).
    pub fn destroy_mr(&self, block: MemoryBlock) -> Result<()> {
        let addr = block.addr();
        let mut registry = self.registry.lock();
        let Some(length) = registry.live.remove(&addr) else {
            return Err(RftpError::Device(format!(
                "no live MR registered at address {addr:#x}"
            )));
        };
        if let Some(free) = registry.free_bytes {
            registry.free_bytes = Some(free + length);
        }
        drop(block); // deregisters the MR and frees the buffer
        Ok(())
    }

    /// Bytes still available to register, or `None` if this context was
    /// opened unbounded and has not yet registered anything.
    #[must_use]
    pub fn free_bytes(&self) -> Option<usize> {
        self.registry.lock().free_bytes
    }
}

fn open_first_usable(dev_list: &DeviceList, port_num: u8) -> Result<(Context, PortAttr)> {
    for dev in dev_list.iter() {
        match try_open(dev, port_num) {
            Ok(pair) => return Ok(pair),
            Err(err) => {
                log::warn!("skipping device {}: {err}", dev.name());
            }
        }
    }
    Err(RftpError::Device(format!(
        "no device has a usable port {port_num}"
    )))
}

fn try_open(dev: &Device, port_num: u8) -> Result<(Context, PortAttr)> {
    let ctx = Context::open(dev)
        .map_err(|err| RftpError::Device(format!("failed to open {}: {err}", dev.name())))?;
    let port_attr = PortAttr::query(&ctx, port_num)
        .map_err(|err| RftpError::Device(format!("failed to query port {port_num}: {err}")))?;
    Ok((ctx, port_attr))
}

/// Shared ownership handle used by a connection to reach the process-wide
/// device context without cloning it.
pub type SharedDevice = Arc<DeviceContext>;
