//! JSON payload codec.
//!
//! Inputs, outputs, journaled values and state fields are all
//! `serde_json::Value` inside the engine. Decoding failures are the caller's
//! fault (400), encoding failures are the handler's (500). Both are terminal:
//! retrying cannot fix a payload.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{HandlerError, TerminalError};

pub const BAD_REQUEST: u16 = 400;

pub fn decode<T: DeserializeOwned>(what: &str, value: serde_json::Value) -> Result<T, HandlerError> {
    serde_json::from_value(value).map_err(|e| {
        HandlerError::Terminal(TerminalError::with_code(
            BAD_REQUEST,
            format!("cannot decode {what}: {e}"),
        ))
    })
}

pub fn encode<T: Serialize + ?Sized>(what: &str, value: &T) -> Result<serde_json::Value, HandlerError> {
    serde_json::to_value(value).map_err(|e| {
        HandlerError::Terminal(TerminalError::new(format!("cannot encode {what}: {e}")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_failures_are_bad_requests() {
        let err = decode::<u64>("input", json!("not a number")).unwrap_err();
        match err {
            HandlerError::Terminal(e) => {
                assert_eq!(e.code, BAD_REQUEST);
                assert!(e.message.starts_with("cannot decode input"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unit_decodes_from_null() {
        decode::<()>("output", serde_json::Value::Null).unwrap();
    }
}
