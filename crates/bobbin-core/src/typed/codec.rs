//! Payload codec - 型付きの値と wire 上の JSON 値の相互変換

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::domain::RemoteError;
use crate::error::BobbinError;

pub fn encode<T: Serialize>(value: &T) -> Result<Value, BobbinError> {
    Ok(serde_json::to_value(value)?)
}

pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, BobbinError> {
    Ok(serde_json::from_value(value)?)
}

/// 相手側から届いた値のデコード。失敗は境界を越えるエラーとして扱う。
pub fn decode_remote<T: DeserializeOwned>(value: Value) -> Result<T, RemoteError> {
    serde_json::from_value(value)
        .map_err(|e| RemoteError::unknown(format!("json decode: {e}"), None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        page: u32,
    }

    #[test]
    fn decode_failure_is_a_codec_error() {
        let err = decode::<Probe>(json!({"page": "x"})).unwrap_err();
        assert!(matches!(err, BobbinError::Codec(_)));
    }

    #[test]
    fn remote_decode_failure_is_unknown() {
        let err = decode_remote::<Probe>(json!([])).unwrap_err();
        assert_eq!(err.name(), "Unknown");
        assert!(err.message().starts_with("json decode"));
    }

    #[test]
    fn encode_then_decode_keeps_value() {
        let v = encode(&Probe { page: 3 }).unwrap();
        assert_eq!(v, json!({"page": 3}));
        assert_eq!(decode::<Probe>(v).unwrap(), Probe { page: 3 });
    }
}
