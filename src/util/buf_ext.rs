use std::mem::size_of;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};

macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                bail!("buffer underflow reading {}", stringify!($ty));
            }
            Ok(self.$getter())
        }
    }
}

/// Checked reads that fail on underflow instead of panicking. Multi-byte values are big endian,
///  variable-length values carry a u16 length prefix.
pub trait BufExt: Buf {
    get_try_impl!(try_u8, u8, get_u8);
    get_try_impl!(try_u16, u16, get_u16);
    get_try_impl!(try_u32, u32, get_u32);
    get_try_impl!(try_i32, i32, get_i32);
    get_try_impl!(try_u64, u64, get_u64);
    get_try_impl!(try_i64, i64, get_i64);
    get_try_impl!(try_f32, f32, get_f32);

    fn try_bytes(&mut self) -> anyhow::Result<Bytes> {
        let len = self.try_u16()? as usize;
        if self.remaining() < len {
            bail!("buffer underflow: {} bytes announced, {} available", len, self.remaining());
        }
        Ok(self.copy_to_bytes(len))
    }

    fn try_string(&mut self) -> anyhow::Result<String> {
        let raw = self.try_bytes()?;
        Ok(String::from_utf8(raw.to_vec())?)
    }
}

/// the longest value a u16 length prefix can announce
pub const MAX_PREFIXED_LEN: usize = u16::MAX as usize;

/// Writes counterparts to [BufExt]. Values that do not fit a u16 length prefix are rejected
///  before anything is written.
pub trait BufMutExt: BufMut {
    fn put_bytes_prefixed(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if data.len() > MAX_PREFIXED_LEN {
            bail!("length-prefixed data is limited to {} bytes, got {}", MAX_PREFIXED_LEN, data.len());
        }
        self.put_u16(data.len() as u16);
        self.put_slice(data);
        Ok(())
    }

    fn put_string(&mut self, s: &str) -> anyhow::Result<()> {
        self.put_bytes_prefixed(s.as_bytes())
    }
}

impl<T: Buf> BufExt for T {}

impl<T: BufMut> BufMutExt for T {}
