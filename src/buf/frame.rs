use crate::proto::Endianness;

/// A fixed-size value which can be stored to and loaded from a buffer in
/// either byte order. The encoded size of a frame equals its alignment.
pub(crate) trait Frame: Copy {
    const SIZE: usize;

    fn store(self, out: &mut Vec<u8>, endianness: Endianness);

    fn load(bytes: &[u8], endianness: Endianness) -> Self;
}

macro_rules! impl_frame {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Frame for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn store(self, out: &mut Vec<u8>, endianness: Endianness) {
                    let bytes = match endianness {
                        Endianness::BIG => self.to_be_bytes(),
                        _ => self.to_le_bytes(),
                    };

                    out.extend_from_slice(&bytes);
                }

                #[inline]
                fn load(bytes: &[u8], endianness: Endianness) -> Self {
                    let mut array = [0; std::mem::size_of::<$ty>()];
                    array.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);

                    match endianness {
                        Endianness::BIG => <$ty>::from_be_bytes(array),
                        _ => <$ty>::from_le_bytes(array),
                    }
                }
            }
        )*
    }
}

impl_frame!(u8, i8, u16, i16, u32, i32, u64, i64, f64);
