//! Memory registration.
//!
//! Two kinds of region exist: [`MemoryRegion`] borrows a caller's buffer and never releases it,
//! [`AllocatedRegion`] owns a zeroed heap buffer and releases it after deregistering.
use std::fmt;
use std::io;

use rdma::ibv::{AccessFlags, ProtectionDomain};
use rdma::mr::MemoryRegion;

use crate::error::{Error, Result};
use crate::work::Sge;

/// A registered local buffer that work requests can point at.
pub trait LocalRegion {
    fn addr(&self) -> u64;
    fn len(&self) -> usize;
    fn lkey(&self) -> u32;
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A scatter-gather entry covering the first `len` bytes.
    fn sge(&self, len: usize) -> Sge {
        debug_assert!(len <= self.len());
        Sge {
            addr: self.addr(),
            length: len as u32,
            lkey: self.lkey(),
        }
    }
}

impl<'a> LocalRegion for MemoryRegion<'a> {
    #[inline]
    fn addr(&self) -> u64 {
        MemoryRegion::addr(self)
    }

    #[inline]
    fn len(&self) -> usize {
        MemoryRegion::len(self)
    }

    #[inline]
    fn lkey(&self) -> u32 {
        MemoryRegion::lkey(self)
    }

    fn bytes(&self) -> &[u8] {
        self
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

/// A heap buffer registered for as long as this value lives.
pub struct AllocatedRegion {
    // declared first so the registration goes before the buffer
    mr: MemoryRegion<'static>,
    _buf: Box<[u8]>,
}

impl fmt::Debug for AllocatedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatedRegion")
            .field("addr", &format_args!("{:#x}", self.mr.addr()))
            .field("len", &self.mr.len())
            .field("lkey", &self.mr.lkey())
            .finish()
    }
}

impl LocalRegion for AllocatedRegion {
    #[inline]
    fn addr(&self) -> u64 {
        self.mr.addr()
    }

    #[inline]
    fn len(&self) -> usize {
        self.mr.len()
    }

    #[inline]
    fn lkey(&self) -> u32 {
        self.mr.lkey()
    }

    fn bytes(&self) -> &[u8] {
        &self.mr
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mr
    }
}

fn no_pd() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "no protection domain")
}

/// A zeroed buffer of `size` bytes, or `ResourceExhaustion` if the heap cannot provide it.
fn zeroed(size: usize) -> Result<Box<[u8]>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size).map_err(|e| {
        tracing::error!("cannot allocate {} bytes: {}", size, e);
        Error::resource("calloc")(io::Error::from_raw_os_error(libc::ENOMEM))
    })?;
    buf.resize(size, 0u8);
    Ok(buf.into_boxed_slice())
}

/// Register `buf` in `pd`. The caller keeps ownership of the buffer.
pub fn register<'a>(
    pd: Option<&ProtectionDomain>,
    buf: &'a mut [u8],
    access: AccessFlags,
) -> Result<MemoryRegion<'a>> {
    let pd = pd.ok_or_else(|| Error::resource("ibv_reg_mr")(no_pd()))?;
    let len = buf.len();
    let mr = MemoryRegion::register(pd, buf, access).map_err(Error::resource("ibv_reg_mr"))?;
    tracing::debug!(
        "registered {} bytes at {:#x}, lkey {:#x}, rkey {:#x}, access {:?}",
        len,
        mr.addr(),
        mr.lkey(),
        mr.rkey(),
        access
    );
    Ok(mr)
}

/// Allocate a zeroed buffer of `size` bytes and register it.
///
/// If registration fails the buffer is released before the error is returned.
pub fn allocate_and_register(
    pd: Option<&ProtectionDomain>,
    size: usize,
    access: AccessFlags,
) -> Result<AllocatedRegion> {
    let pd = pd.ok_or_else(|| Error::resource("ibv_reg_mr")(no_pd()))?;
    if size == 0 {
        return Err(Error::resource("calloc")(io::Error::new(
            io::ErrorKind::InvalidInput,
            "zero-sized buffer",
        )));
    }
    let mut buf = zeroed(size)?;
    // SAFETY: the boxed slice moves into the returned region together with the registration and
    // is dropped after it, so the registered range outlives the registration.
    let mr = unsafe { MemoryRegion::register_raw(pd, buf.as_mut_ptr(), size, access) }
        .map_err(Error::resource("ibv_reg_mr"))?;
    tracing::debug!(
        "allocated and registered {} bytes at {:#x}, lkey {:#x}, rkey {:#x}",
        size,
        mr.addr(),
        mr.lkey(),
        mr.rkey()
    );
    Ok(AllocatedRegion { mr, _buf: buf })
}

/// Deregister a borrowed-buffer region. The buffer itself is untouched.
pub fn deregister(mr: Option<MemoryRegion<'_>>) -> io::Result<()> {
    match mr {
        Some(mr) => mr.deregister(),
        None => {
            tracing::debug!("deregister: no memory region");
            Ok(())
        }
    }
}

/// Deregister an allocated region and release its buffer.
pub fn free(region: Option<AllocatedRegion>) -> io::Result<()> {
    match region {
        Some(AllocatedRegion { mr, _buf }) => {
            let ret = mr.deregister();
            drop(_buf);
            ret
        }
        None => {
            tracing::debug!("free: no memory region");
            Ok(())
        }
    }
}
