use crate::buffer::PAGE_SIZE;
use crate::error::{ChalkDBError, ChalkDBResult};
use crate::storage::codec::{CommonCodec, DecodedData};
use crate::storage::page::HeaderPage;

pub struct HeaderPageCodec;

impl HeaderPageCodec {
    pub fn encode(page: &HeaderPage) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(CommonCodec::encode_u32(page.records.len() as u32));
        for (name, root_page_id) in page.records.iter() {
            bytes.extend(CommonCodec::encode_string(name));
            bytes.extend(CommonCodec::encode_u32(*root_page_id));
        }
        assert!(bytes.len() <= PAGE_SIZE, "header page overflows page size");
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> ChalkDBResult<DecodedData<HeaderPage>> {
        if bytes.len() != PAGE_SIZE {
            return Err(ChalkDBError::Storage(format!(
                "header page size is {} instead of {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }
        let (count, offset) = CommonCodec::decode_u32(bytes)?;
        let mut left_bytes = &bytes[offset..];

        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (name, offset) = CommonCodec::decode_string(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let (root_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            records.push((name, root_page_id));
        }

        Ok((HeaderPage { records }, PAGE_SIZE - left_bytes.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_page_round_trip() {
        let mut page = HeaderPage::new();
        page.insert_record("orders_pk", 12);
        page.insert_record("users_pk", 40);

        let (decoded, _) = HeaderPageCodec::decode(&HeaderPageCodec::encode(&page)).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn empty_bytes_decode_as_empty_directory() {
        let bytes = vec![0u8; PAGE_SIZE];
        let (decoded, _) = HeaderPageCodec::decode(&bytes).unwrap();
        assert!(decoded.records.is_empty());
    }
}
