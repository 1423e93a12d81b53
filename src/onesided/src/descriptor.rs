//! The 16-byte buffer descriptor exchanged over SEND/RECV before any one-sided operation.
//!
//! Both peers are assumed to share byte order, so fields travel in native endianness.
use std::fmt;
use std::mem;

use static_assertions::const_assert_eq;

use crate::error::{Error, Result};

/// Permission to access a registered buffer from the remote side.
///
/// The side that hands a buffer out fills this with the *local* key of its registration; the side
/// that receives it passes the same value as the *remote* key of its RDMA WRITE and READ work
/// requests. It is opaque to both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct AccessToken(u32);

impl AccessToken {
    #[inline]
    pub const fn new(key: u32) -> Self {
        AccessToken(key)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// `{ address, length, token }`, packed with no padding.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferDescriptor {
    pub address: u64,
    pub length: u32,
    pub token: AccessToken,
}

pub const DESCRIPTOR_LEN: usize = mem::size_of::<BufferDescriptor>();

const_assert_eq!(DESCRIPTOR_LEN, 16);

impl BufferDescriptor {
    pub fn new(address: u64, length: u32, token: AccessToken) -> Self {
        BufferDescriptor {
            address,
            length,
            token,
        }
    }

    pub fn encode(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut buf = [0u8; DESCRIPTOR_LEN];
        let (address, length, token) = (self.address, self.length, self.token);
        buf[0..8].copy_from_slice(&address.to_ne_bytes());
        buf[8..12].copy_from_slice(&length.to_ne_bytes());
        buf[12..16].copy_from_slice(&token.get().to_ne_bytes());
        buf
    }

    /// Write the encoded descriptor into the front of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        let dst = buf.get_mut(..DESCRIPTOR_LEN).ok_or_else(|| {
            Error::MalformedDescriptor(format!(
                "buffer of {} bytes cannot hold a descriptor",
                buf.len()
            ))
        })?;
        dst.copy_from_slice(&self.encode());
        Ok(())
    }

    /// Decode from the front of `buf`. Trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DESCRIPTOR_LEN {
            return Err(Error::MalformedDescriptor(format!(
                "need {} bytes, got {}",
                DESCRIPTOR_LEN,
                buf.len()
            )));
        }
        let mut address = [0u8; 8];
        let mut length = [0u8; 4];
        let mut token = [0u8; 4];
        address.copy_from_slice(&buf[0..8]);
        length.copy_from_slice(&buf[8..12]);
        token.copy_from_slice(&buf[12..16]);
        Ok(BufferDescriptor {
            address: u64::from_ne_bytes(address),
            length: u32::from_ne_bytes(length),
            token: AccessToken::new(u32::from_ne_bytes(token)),
        })
    }
}

impl fmt::Display for BufferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (address, length, token) = (self.address, self.length, self.token);
        writeln!(f, "---------------------------------------------------------")?;
        writeln!(f, "buffer attr, addr: {:#x} , len: {} , stag : {:#x} ", address, length, token.get())?;
        write!(f, "---------------------------------------------------------")
    }
}
