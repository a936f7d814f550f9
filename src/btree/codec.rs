//! Fixed-width encodings for index keys and values.

/// A type with a constant on-page width.
pub trait FixedWidth: Copy + Send + Sync + std::fmt::Debug + 'static {
    const WIDTH: usize;

    /// Writes exactly `WIDTH` bytes into `out`.
    fn write_to(&self, out: &mut [u8]);

    /// Reads from the first `WIDTH` bytes of `buf`.
    fn read_from(buf: &[u8]) -> Self;
}

/// Keys order by their decoded value, not by their encoded bytes.
pub trait FixedKey: FixedWidth + Ord {}

impl<T: FixedWidth + Ord> FixedKey for T {}

/// Any fixed-width type can be stored as a value.
pub trait FixedValue: FixedWidth {}

impl<T: FixedWidth> FixedValue for T {}

macro_rules! fixed_int {
    ($($t:ty),*) => {$(
        impl FixedWidth for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn write_to(&self, out: &mut [u8]) {
                out[..Self::WIDTH].copy_from_slice(&self.to_le_bytes());
            }

            fn read_from(buf: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&buf[..Self::WIDTH]);
                <$t>::from_le_bytes(raw)
            }
        }
    )*};
}

fixed_int!(u16, u32, u64, u128, i16, i32, i64, i128);

impl<const N: usize> FixedWidth for [u8; N] {
    const WIDTH: usize = N;

    fn write_to(&self, out: &mut [u8]) {
        out[..N].copy_from_slice(self);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut raw = [0u8; N];
        raw.copy_from_slice(&buf[..N]);
        raw
    }
}
