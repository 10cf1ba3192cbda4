use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Deterministic byte codec for everything the engine stores.
///
/// Values are canonical JSON. Every map in the stored data model is a
/// `BTreeMap`, so encoding a value twice yields identical bytes, and a
/// bare revision number encodes to its plain decimal form.
#[derive(Clone, Copy, Debug, Default)]
pub struct Codec;

impl Codec {
    /// Encodes a value.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|err| Error::Wtf(format!("unencodable value: {err}")))
    }

    /// Decodes a value, reporting failures as *BadData*.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|err| Error::bad_data(format!("undecodable value: {err}")))
    }

    /// Decodes a revision number, range-checking it as *BadData*.
    pub fn decode_rev_num(&self, bytes: &[u8]) -> Result<u64> {
        self.decode::<i64>(bytes)
            .ok()
            .filter(|n| *n >= 0)
            .map(|n| n as u64)
            .ok_or_else(|| Error::bad_data("revision number out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rev_num_is_plain_decimal() {
        let codec = Codec;
        assert_eq!(codec.encode(&42u64).unwrap(), b"42");
        assert_eq!(codec.decode_rev_num(b"42").unwrap(), 42);
    }

    #[test]
    fn negative_rev_num_is_bad_data() {
        assert!(matches!(Codec.decode_rev_num(b"-1"), Err(Error::BadData(_))));
        assert!(matches!(Codec.decode_rev_num(b"{}"), Err(Error::BadData(_))));
    }

    #[test]
    fn encoding_is_deterministic() {
        use std::collections::BTreeMap;
        let map: BTreeMap<String, u32> = [("b".into(), 2), ("a".into(), 1)].into_iter().collect();
        assert_eq!(Codec.encode(&map).unwrap(), Codec.encode(&map.clone()).unwrap());
        assert_eq!(Codec.encode(&map).unwrap(), br#"{"a":1,"b":2}"#.to_vec());
    }
}
