//! Fixed, versioned, little-endian wire types for the manager/worker protocol
//! and the typed payload helpers used by every exchange.

use crate::combi_error::CombiError;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Copy a received byte buffer into a freshly allocated, properly aligned
/// `Vec<T>`. Received buffers carry no alignment guarantee, so this never
/// casts in place.
pub fn decode_vec<T: Pod>(bytes: &[u8], neighbor: usize) -> Result<Vec<T>, CombiError> {
    let width = size_of::<T>();
    if width == 0 || bytes.len() % width != 0 {
        return Err(CombiError::BufferSizeMismatch {
            neighbor,
            expected: bytes.len().next_multiple_of(width.max(1)),
            got: bytes.len(),
        });
    }
    let mut out = vec![T::zeroed(); bytes.len() / width];
    cast_slice_mut(&mut out).copy_from_slice(bytes);
    Ok(out)
}

/// Decode exactly one `T`.
pub fn decode_one<T: Pod>(bytes: &[u8], neighbor: usize) -> Result<T, CombiError> {
    if bytes.len() != size_of::<T>() {
        return Err(CombiError::BufferSizeMismatch {
            neighbor,
            expected: size_of::<T>(),
            got: bytes.len(),
        });
    }
    let mut out = T::zeroed();
    cast_slice_mut(std::slice::from_mut(&mut out)).copy_from_slice(bytes);
    Ok(out)
}

/// Decode exactly `expected` values of `T`.
pub fn decode_exact<T: Pod>(
    bytes: &[u8],
    expected: usize,
    neighbor: usize,
) -> Result<Vec<T>, CombiError> {
    if bytes.len() != expected * size_of::<T>() {
        return Err(CombiError::BufferSizeMismatch {
            neighbor,
            expected: expected * size_of::<T>(),
            got: bytes.len(),
        });
    }
    decode_vec(bytes, neighbor)
}

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// All multi-byte integers in these structs are **little-endian** on the wire.
/// We store them pre-LE with `.to_le()` and decode with `.from_le()`.

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,  // = WIRE_VERSION.to_le()
    pub kind_le: u16,     // signal number
    pub reserved_le: u32, // future use; keep zero
}

impl WireHdr {
    pub fn new(kind: u16) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            reserved_le: 0,
        }
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }

    /// Decode and reject foreign wire versions.
    pub fn decode(bytes: &[u8], neighbor: usize) -> Result<Self, CombiError> {
        let hdr: WireHdr = decode_one(bytes, neighbor)?;
        if hdr.version() != WIRE_VERSION {
            return Err(CombiError::WireVersion {
                expected: WIRE_VERSION,
                got: hdr.version(),
            });
        }
        Ok(hdr)
    }
}

/// Group status reply.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireStatus {
    pub status_le: u16,
    pub version_le: u16,
}
impl WireStatus {
    pub fn new(status: u16) -> Self {
        Self {
            status_le: status.to_le(),
            version_le: WIRE_VERSION.to_le(),
        }
    }
    pub fn status(&self) -> u16 {
        u16::from_le(self.status_le)
    }

    pub fn decode(bytes: &[u8], neighbor: usize) -> Result<Self, CombiError> {
        let st: WireStatus = decode_one(bytes, neighbor)?;
        let got = u16::from_le(st.version_le);
        if got != WIRE_VERSION {
            return Err(CombiError::WireVersion {
                expected: WIRE_VERSION,
                got,
            });
        }
        Ok(st)
    }
}

// ===== Compile-time sanity checks =========================================

const_assert_eq!(size_of::<WireHdr>(), 8);
const_assert_eq!(size_of::<WireStatus>(), 4);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_f64_payload_from_unaligned_bytes() {
        let v = [1.5f64, -2.25, 3.0];
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(cast_slice(&v));
        let out: Vec<f64> = decode_vec(&bytes[1..], 0).unwrap();
        assert_eq!(out, v);
    }

    #[test]
    fn length_errors_name_the_neighbor() {
        let err = decode_one::<WireStatus>(&[1, 2, 3], 5).unwrap_err();
        assert!(matches!(
            err,
            CombiError::BufferSizeMismatch { neighbor: 5, expected: 4, got: 3 }
        ));
        assert!(decode_vec::<f64>(&[0u8; 12], 1).is_err());
        assert!(decode_exact::<u32>(&[0u8; 8], 3, 1).is_err());
    }

    #[test]
    fn version_guard() {
        let hdr = WireHdr::new(4);
        assert_eq!(hdr.version(), WIRE_VERSION);
        let mut raw = hdr;
        raw.version_le = 99u16.to_le();
        assert!(matches!(
            WireHdr::decode(cast_slice(&[raw]), 0),
            Err(CombiError::WireVersion { expected: WIRE_VERSION, got: 99 })
        ));
        assert_eq!(WireHdr::decode(cast_slice(&[hdr]), 0).unwrap().kind(), 4);
    }
}
