//! Registered memory regions.
use std::io;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::slice;

use crate::ffi;
use crate::ibv::{AccessFlags, ProtectionDomain};

/// A memory region registered in a protection domain.
///
/// The region borrows the buffer it covers for `'a`, so the buffer cannot be released while the
/// registration is alive. The region must still be deregistered before its protection domain is
/// deallocated; that ordering is the owner's job.
#[derive(Debug)]
pub struct MemoryRegion<'a> {
    mr: *mut ffi::ibv_mr,
    _marker: PhantomData<&'a mut [u8]>,
}

unsafe impl<'a> Send for MemoryRegion<'a> {}
unsafe impl<'a> Sync for MemoryRegion<'a> {}

impl<'a> MemoryRegion<'a> {
    pub fn register(
        pd: &ProtectionDomain,
        buf: &'a mut [u8],
        access: AccessFlags,
    ) -> io::Result<Self> {
        unsafe { Self::register_raw(pd, buf.as_mut_ptr(), buf.len(), access) }
    }

    /// # Safety
    ///
    /// `addr..addr + len` must stay valid, and must not be released, for as long as the returned
    /// region lives.
    pub unsafe fn register_raw(
        pd: &ProtectionDomain,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<Self> {
        let mr = ffi::ibv_reg_mr(pd.pd, addr as *mut _, len as _, access.bits() as i32);
        if mr.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(MemoryRegion {
                mr,
                _marker: PhantomData,
            })
        }
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        unsafe { &*self.mr }.addr as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        unsafe { &*self.mr }.length as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        unsafe { &*self.mr }.lkey
    }

    #[inline]
    pub fn rkey(&self) -> u32 {
        unsafe { &*self.mr }.rkey
    }

    pub fn deregister(self) -> io::Result<()> {
        let mr = self.mr;
        mem::forget(self);
        let errno = unsafe { ffi::ibv_dereg_mr(mr) };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }
}

impl<'a> Deref for MemoryRegion<'a> {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        let mr = unsafe { &*self.mr };
        unsafe { slice::from_raw_parts(mr.addr.cast(), mr.length as _) }
    }
}

impl<'a> DerefMut for MemoryRegion<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        let mr = unsafe { &*self.mr };
        unsafe { slice::from_raw_parts_mut(mr.addr.cast(), mr.length as _) }
    }
}

impl<'a> Drop for MemoryRegion<'a> {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_dereg_mr(self.mr) };
        if errno != 0 {
            log::warn!(
                "error occured when deregistering mr: {}",
                io::Error::from_raw_os_error(errno)
            );
        }
    }
}
