//! Fixed-width values readable from and writable to an address space.

use crate::config::ByteOrder;

mod private {
    pub trait Sealed {}
}

/// A fixed-width integer or IEEE float with a byte-order aware codec
pub trait Scalar: Copy + private::Sealed {
    /// Encoded width in bytes
    const SIZE: usize;

    /// Decode from the first `SIZE` bytes of `bytes`
    fn decode(bytes: &[u8], order: ByteOrder) -> Self;

    /// Encode into the first `SIZE` bytes of `bytes`
    fn encode(self, bytes: &mut [u8], order: ByteOrder);
}

macro_rules! impl_scalar {
    ($($t:ty),* $(,)?) => {
        $(
            impl private::Sealed for $t {}

            impl Scalar for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                #[inline]
                fn decode(bytes: &[u8], order: ByteOrder) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    match order {
                        ByteOrder::BigEndian => <$t>::from_be_bytes(raw),
                        ByteOrder::LittleEndian => <$t>::from_le_bytes(raw),
                    }
                }

                #[inline]
                fn encode(self, bytes: &mut [u8], order: ByteOrder) {
                    let raw = match order {
                        ByteOrder::BigEndian => self.to_be_bytes(),
                        ByteOrder::LittleEndian => self.to_le_bytes(),
                    };
                    bytes[..Self::SIZE].copy_from_slice(&raw);
                }
            }
        )*
    };
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);
