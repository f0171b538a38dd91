//! # Wire Field Accessors
//!
//! Every multi-byte field crosses the wire in one canonical byte order
//! (big-endian). Fields are written and read only through [`WireField`], which
//! is sealed and implemented for exactly `u8`, `u16` and `u32`; a field of any
//! other width has no accessor and is rejected at build time.
//!
//! 8-bit fields pass through unchanged. Conversion is applied uniformly, never
//! selectively: a body that writes one field with `put_u16_le` and the rest
//! through this trait would silently disagree with its peer.

use crate::error::{MalformedKind, MxError, Result};
use bytes::{Buf, BufMut, Bytes};

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
}

/// A fixed-width integer that may appear in a packet body.
pub trait WireField: sealed::Sealed + Copy + Sized {
    /// Width in bytes on the wire.
    const WIDTH: usize;

    /// Host order to wire order.
    fn to_wire(self) -> Self;

    /// Wire order to host order.
    fn from_wire(self) -> Self;

    /// Append the field in wire order.
    fn put<B: BufMut>(self, dst: &mut B);

    /// Read the field from the front of `src`, which must hold `WIDTH` bytes.
    fn take<B: Buf>(src: &mut B) -> Self;
}

impl WireField for u8 {
    const WIDTH: usize = 1;

    #[inline]
    fn to_wire(self) -> Self {
        self
    }

    #[inline]
    fn from_wire(self) -> Self {
        self
    }

    #[inline]
    fn put<B: BufMut>(self, dst: &mut B) {
        dst.put_u8(self);
    }

    #[inline]
    fn take<B: Buf>(src: &mut B) -> Self {
        src.get_u8()
    }
}

impl WireField for u16 {
    const WIDTH: usize = 2;

    #[inline]
    fn to_wire(self) -> Self {
        self.to_be()
    }

    #[inline]
    fn from_wire(self) -> Self {
        u16::from_be(self)
    }

    #[inline]
    fn put<B: BufMut>(self, dst: &mut B) {
        dst.put_slice(&self.to_be_bytes());
    }

    #[inline]
    fn take<B: Buf>(src: &mut B) -> Self {
        let mut raw = [0u8; 2];
        src.copy_to_slice(&mut raw);
        u16::from_be_bytes(raw)
    }
}

impl WireField for u32 {
    const WIDTH: usize = 4;

    #[inline]
    fn to_wire(self) -> Self {
        self.to_be()
    }

    #[inline]
    fn from_wire(self) -> Self {
        u32::from_be(self)
    }

    #[inline]
    fn put<B: BufMut>(self, dst: &mut B) {
        dst.put_slice(&self.to_be_bytes());
    }

    #[inline]
    fn take<B: Buf>(src: &mut B) -> Self {
        let mut raw = [0u8; 4];
        src.copy_to_slice(&mut raw);
        u32::from_be_bytes(raw)
    }
}

const _: () = assert!(<u8 as WireField>::WIDTH == 1);
const _: () = assert!(<u16 as WireField>::WIDTH == 2);
const _: () = assert!(<u32 as WireField>::WIDTH == 4);

/// Bounds-checked cursor over a received body.
///
/// Payload slices are carved out of the underlying [`Bytes`] without copying.
#[derive(Debug, Clone)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Read one field, failing with `Truncated` if the body is too short.
    #[inline]
    pub fn field<T: WireField>(&mut self) -> Result<T> {
        if self.buf.len() < T::WIDTH {
            return Err(MxError::MalformedPacket(MalformedKind::Truncated));
        }
        Ok(T::take(&mut self.buf))
    }

    /// Skip reserved bytes.
    #[inline]
    pub fn skip(&mut self, n: usize) -> Result<()> {
        if self.buf.len() < n {
            return Err(MxError::MalformedPacket(MalformedKind::Truncated));
        }
        self.buf.advance(n);
        Ok(())
    }

    /// Take exactly `n` payload bytes.
    #[inline]
    pub fn payload(&mut self, n: usize) -> Result<Bytes> {
        if self.buf.len() < n {
            return Err(MxError::MalformedPacket(MalformedKind::LengthMismatch));
        }
        Ok(self.buf.split_to(n))
    }

    /// Take whatever is left.
    #[inline]
    pub fn rest(&mut self) -> Bytes {
        std::mem::take(&mut self.buf)
    }
}
