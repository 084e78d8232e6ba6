use std::io::Read;

use crate::error::{RelayError, RelayResult};

/**
    Round `n` up to the next multiple of `step`.
*/
pub const fn boundary(step: usize, n: usize) -> usize {
    n.div_ceil(step) * step
}

/**
    Read exactly `buf.len()` bytes, reporting how far the read got on early EOF.
*/
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> RelayResult<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(RelayError::ShortRead {
                    expected: buf.len(),
                    actual: filled,
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(RelayError::from_read(e, buf.len(), filled)),
        }
    }
    Ok(())
}

/**
    Copy `src` into `dst`, truncating to whatever fits. Remaining bytes of `dst`
    are left untouched.
*/
pub fn copy_truncated(dst: &mut [u8], src: &[u8]) {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
}

/**
    Interpret `bytes` as a NUL-terminated ASCII string.
*/
pub fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub(crate) fn be_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

pub(crate) fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/**
    Big-endian field readers over a byte slice. Callers check bounds first.
*/
pub trait ReadBe {
    fn u16_at(&self, offset: usize) -> u16;
    fn u24_at(&self, offset: usize) -> u32;
    fn u32_at(&self, offset: usize) -> u32;
}

impl ReadBe for [u8] {
    fn u16_at(&self, offset: usize) -> u16 {
        be_u16(self, offset)
    }

    fn u24_at(&self, offset: usize) -> u32 {
        u32::from_be_bytes([0, self[offset], self[offset + 1], self[offset + 2]])
    }

    fn u32_at(&self, offset: usize) -> u32 {
        be_u32(self, offset)
    }
}
