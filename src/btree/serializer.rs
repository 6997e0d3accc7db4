//! Key and value serializers.
//!
//! A tree stores typed keys and values; the node codec turns them into
//! bytes through a `Serializer`. Fixed-size serializers are written bare,
//! variable-size ones get a varint length prefix inside the node record.

use crate::error::SerializerError;
use crate::types::{put_varint, read_varint, BlockId};
use uuid::Uuid;

/// Result of a serializer call
pub type SerializeResult<T> = std::result::Result<T, SerializerError>;

/// Encodes and decodes values of type `T`
pub trait Serializer<T> {
    /// Encode a value
    fn serialize(&self, value: &T) -> SerializeResult<Vec<u8>>;

    /// Decode a value from exactly the bytes `serialize` produced
    fn deserialize(&self, bytes: &[u8]) -> SerializeResult<T>;

    /// `Some(n)` if every encoding is exactly `n` bytes
    fn fixed_size(&self) -> Option<usize> {
        None
    }
}

fn expect_len(bytes: &[u8], len: usize, what: &str) -> SerializeResult<()> {
    if bytes.len() != len {
        return Err(format!("{} needs {} bytes, got {}", what, len, bytes.len()).into());
    }
    Ok(())
}

macro_rules! fixed_int_serializer {
    ($name:ident, $ty:ty, $len:expr) => {
        #[doc = concat!("Little-endian `", stringify!($ty), "`")]
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Serializer<$ty> for $name {
            fn serialize(&self, value: &$ty) -> SerializeResult<Vec<u8>> {
                Ok(value.to_le_bytes().to_vec())
            }

            fn deserialize(&self, bytes: &[u8]) -> SerializeResult<$ty> {
                expect_len(bytes, $len, stringify!($ty))?;
                let mut raw = [0u8; $len];
                raw.copy_from_slice(bytes);
                Ok(<$ty>::from_le_bytes(raw))
            }

            fn fixed_size(&self) -> Option<usize> {
                Some($len)
            }
        }
    };
}

fixed_int_serializer!(U32Serializer, u32, 4);
fixed_int_serializer!(I32Serializer, i32, 4);
fixed_int_serializer!(U64Serializer, u64, 8);
fixed_int_serializer!(I64Serializer, i64, 8);

/// Record ids as 8-byte values
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordIdSerializer;

impl Serializer<BlockId> for RecordIdSerializer {
    fn serialize(&self, value: &BlockId) -> SerializeResult<Vec<u8>> {
        U64Serializer.serialize(&value.value())
    }

    fn deserialize(&self, bytes: &[u8]) -> SerializeResult<BlockId> {
        U64Serializer.deserialize(bytes).map(BlockId::new)
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(8)
    }
}

/// UUIDs as their 16 raw bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidSerializer;

impl Serializer<Uuid> for UuidSerializer {
    fn serialize(&self, value: &Uuid) -> SerializeResult<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> SerializeResult<Uuid> {
        Ok(Uuid::from_slice(bytes)?)
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(16)
    }
}

/// UTF-8 strings
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialize(&self, value: &String) -> SerializeResult<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> SerializeResult<String> {
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

/// Raw byte strings, stored as-is
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, value: &Vec<u8>) -> SerializeResult<Vec<u8>> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> SerializeResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Composite `(A, B)` keys such as `(String, i32)`
#[derive(Debug, Clone, Copy, Default)]
pub struct PairSerializer<SA, SB> {
    first: SA,
    second: SB,
}

impl<SA, SB> PairSerializer<SA, SB> {
    pub fn new(first: SA, second: SB) -> Self {
        Self { first, second }
    }
}

impl<A, B, SA, SB> Serializer<(A, B)> for PairSerializer<SA, SB>
where
    SA: Serializer<A>,
    SB: Serializer<B>,
{
    fn serialize(&self, value: &(A, B)) -> SerializeResult<Vec<u8>> {
        let first = self.first.serialize(&value.0)?;
        let second = self.second.serialize(&value.1)?;

        let mut buf = Vec::with_capacity(first.len() + second.len() + 2);
        if self.first.fixed_size().is_none() {
            put_varint(&mut buf, first.len() as u64);
        }
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second);
        Ok(buf)
    }

    fn deserialize(&self, bytes: &[u8]) -> SerializeResult<(A, B)> {
        let (start, len) = match self.first.fixed_size() {
            Some(n) => (0, n),
            None => {
                let (len, used) = read_varint(bytes).ok_or("truncated pair length")?;
                (used, len as usize)
            }
        };
        let end = start.checked_add(len).filter(|&end| end <= bytes.len()).ok_or_else(|| {
            format!("pair first element of {} bytes overruns {} byte key", len, bytes.len())
        })?;

        let first = self.first.deserialize(&bytes[start..end])?;
        let second = self.second.deserialize(&bytes[end..])?;
        Ok((first, second))
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(self.first.fixed_size()? + self.second.fixed_size()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_ints() {
        let bytes = U32Serializer.serialize(&0x0102_0304).unwrap();
        assert_eq!(bytes, vec![4, 3, 2, 1]);
        assert_eq!(U32Serializer.deserialize(&bytes).unwrap(), 0x0102_0304);
        assert!(U32Serializer.deserialize(&bytes[..3]).is_err());
        assert_eq!(I64Serializer.deserialize(&I64Serializer.serialize(&-5).unwrap()).unwrap(), -5);
    }

    #[test]
    fn test_invalid_utf8() {
        assert!(StringSerializer.deserialize(&[0xFF, 0xFE]).is_err());
    }

    #[test]
    fn test_uuid() {
        let id = Uuid::new_v4();
        let bytes = UuidSerializer.serialize(&id).unwrap();
        assert_eq!(UuidSerializer.deserialize(&bytes).unwrap(), id);
        assert!(UuidSerializer.deserialize(&bytes[..10]).is_err());
    }

    #[test]
    fn test_string_int_pair() {
        let ser = PairSerializer::new(StringSerializer, I32Serializer);
        assert_eq!(ser.fixed_size(), None);

        let key = ("report.txt".to_string(), 1_700_000_000);
        let bytes = ser.serialize(&key).unwrap();
        assert_eq!(ser.deserialize(&bytes).unwrap(), key);

        // Length prefix claims more than is there
        assert!(ser.deserialize(&[50, b'a']).is_err());
    }

    #[test]
    fn test_fixed_pair_has_no_prefix() {
        let ser = PairSerializer::new(U32Serializer, U64Serializer);
        assert_eq!(ser.fixed_size(), Some(12));
        assert_eq!(ser.serialize(&(1, 2)).unwrap().len(), 12);
    }
}
