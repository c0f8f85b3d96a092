use crate::error::{ChalkDBError, ChalkDBResult};
use crate::storage::codec::DecodedData;

pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_u8(data: u8) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u8(bytes: &[u8]) -> ChalkDBResult<DecodedData<u8>> {
        if bytes.is_empty() {
            return Err(ChalkDBError::Internal(
                "bytes exhausted while decoding u8".to_string(),
            ));
        }
        Ok((bytes[0], 1))
    }

    pub fn encode_u16(data: u16) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u16(bytes: &[u8]) -> ChalkDBResult<DecodedData<u16>> {
        if bytes.len() < 2 {
            return Err(ChalkDBError::Internal(format!(
                "bytes length {} is less than 2",
                bytes.len()
            )));
        }
        Ok((u16::from_be_bytes([bytes[0], bytes[1]]), 2))
    }

    pub fn encode_u32(data: u32) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u32(bytes: &[u8]) -> ChalkDBResult<DecodedData<u32>> {
        if bytes.len() < 4 {
            return Err(ChalkDBError::Internal(format!(
                "bytes length {} is less than 4",
                bytes.len()
            )));
        }
        Ok((
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            4,
        ))
    }

    pub fn encode_u64(data: u64) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u64(bytes: &[u8]) -> ChalkDBResult<DecodedData<u64>> {
        if bytes.len() < 8 {
            return Err(ChalkDBError::Internal(format!(
                "bytes length {} is less than 8",
                bytes.len()
            )));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        Ok((u64::from_be_bytes(buf), 8))
    }

    /// Length-prefixed byte string (u32 length + contents).
    pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + data.len());
        bytes.extend(Self::encode_u32(data.len() as u32));
        bytes.extend_from_slice(data);
        bytes
    }

    pub fn decode_bytes(bytes: &[u8]) -> ChalkDBResult<DecodedData<Vec<u8>>> {
        let (length, offset) = Self::decode_u32(bytes)?;
        let length = length as usize;
        if bytes.len() < offset + length {
            return Err(ChalkDBError::Internal(format!(
                "bytes length {} is less than expected {}",
                bytes.len(),
                offset + length
            )));
        }
        Ok((bytes[offset..offset + length].to_vec(), offset + length))
    }

    pub fn encode_string(data: &str) -> Vec<u8> {
        Self::encode_bytes(data.as_bytes())
    }

    pub fn decode_string(bytes: &[u8]) -> ChalkDBResult<DecodedData<String>> {
        let (raw, offset) = Self::decode_bytes(bytes)?;
        let string = String::from_utf8(raw)
            .map_err(|e| ChalkDBError::Internal(format!("invalid utf-8 string: {}", e)))?;
        Ok((string, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::CommonCodec;

    #[test]
    fn primitive_round_trips() {
        assert_eq!(CommonCodec::decode_u8(&CommonCodec::encode_u8(7)).unwrap().0, 7);
        assert_eq!(
            CommonCodec::decode_u16(&CommonCodec::encode_u16(513)).unwrap().0,
            513
        );
        assert_eq!(
            CommonCodec::decode_u32(&CommonCodec::encode_u32(70000)).unwrap().0,
            70000
        );
        assert_eq!(
            CommonCodec::decode_u64(&CommonCodec::encode_u64(1 << 40)).unwrap().0,
            1 << 40
        );
    }

    #[test]
    fn byte_strings_round_trip_and_advance() {
        let mut buf = CommonCodec::encode_bytes(b"hello");
        buf.extend(CommonCodec::encode_string("world"));
        let (first, offset) = CommonCodec::decode_bytes(&buf).unwrap();
        assert_eq!(first, b"hello");
        let (second, _) = CommonCodec::decode_string(&buf[offset..]).unwrap();
        assert_eq!(second, "world");
    }

    #[test]
    fn truncated_input_errors() {
        assert!(CommonCodec::decode_u32(&[1, 2]).is_err());
        let mut buf = CommonCodec::encode_bytes(b"abc");
        buf.truncate(buf.len() - 1);
        assert!(CommonCodec::decode_bytes(&buf).is_err());
    }
}
