use bytes::{Buf, BufMut};
use crate::error::ProtocolError;

/// XDR encodes everything in units of four bytes, padding variable-length data with zeroes
pub fn xdr_padded_len(len: usize) -> usize {
    (len + 3) & !3
}

macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> Result<$ty, ProtocolError> {
            if self.remaining() < size_of::<$ty>() {
                return Err(ProtocolError::Malformed);
            }
            Ok(self.$getter())
        }
    }
}

/// Reading XDR data from untrusted buffers, i.e. without panicking on underflow
pub trait XdrBufExt: Buf {
    get_try_impl!(try_get_xdr_u32, u32, get_u32);

    /// Skips a variable-length opaque item (length prefix, data and padding). Lengths above
    ///  `max_len` are treated as malformed.
    fn try_skip_opaque(&mut self, max_len: usize) -> Result<(), ProtocolError> {
        let len = self.try_get_xdr_u32()? as usize;
        if len > max_len {
            return Err(ProtocolError::Malformed);
        }
        let padded = xdr_padded_len(len);
        if self.remaining() < padded {
            return Err(ProtocolError::Malformed);
        }
        self.advance(padded);
        Ok(())
    }
}
impl<T: Buf + ?Sized> XdrBufExt for T {}

pub trait XdrBufMutExt: BufMut {
    fn put_xdr_opaque(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.put_slice(data);
        self.put_bytes(0, xdr_padded_len(data.len()) - data.len());
    }
}
impl<T: BufMut + ?Sized> XdrBufMutExt for T {}
