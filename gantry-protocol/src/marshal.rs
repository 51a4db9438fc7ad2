//! Pluggable conversion between application messages and frames.

use crate::error::ProtocolError;
use crate::frame::Frame;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Encoder/decoder pair used at the session boundary.
///
/// Marshalling never touches the stream; framing errors stay in the codec.
pub trait Marshal: Send + Sync + 'static {
    type Message: Send + 'static;

    fn marshal(&self, message: &Self::Message) -> Result<Frame, ProtocolError>;

    fn unmarshal(&self, frame: &Frame) -> Result<Self::Message, ProtocolError>;
}

/// Passes frame bodies through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawMarshal {
    operation: u16,
}

impl RawMarshal {
    pub fn new(operation: u16) -> Self {
        Self { operation }
    }
}

impl Marshal for RawMarshal {
    type Message = Bytes;

    fn marshal(&self, message: &Bytes) -> Result<Frame, ProtocolError> {
        Ok(Frame::new(self.operation, message.clone()))
    }

    fn unmarshal(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        Ok(frame.body.clone())
    }
}

/// Serializes messages as JSON bodies under a fixed operation code.
pub struct JsonMarshal<T> {
    operation: u16,
    _message: PhantomData<fn() -> T>,
}

impl<T> JsonMarshal<T> {
    pub fn new(operation: u16) -> Self {
        Self {
            operation,
            _message: PhantomData,
        }
    }
}

impl<T> Marshal for JsonMarshal<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Message = T;

    fn marshal(&self, message: &T) -> Result<Frame, ProtocolError> {
        let body = serde_json::to_vec(message)?;
        Ok(Frame::new(self.operation, body))
    }

    fn unmarshal(&self, frame: &Frame) -> Result<T, ProtocolError> {
        if frame.operation() != self.operation {
            return Err(ProtocolError::Marshal(format!(
                "unexpected operation {} (want {})",
                frame.operation(),
                self.operation
            )));
        }
        Ok(serde_json::from_slice(&frame.body)?)
    }
}

/// Marshal built from a pair of functions.
pub struct FnMarshal<M, E, D> {
    encode: E,
    decode: D,
    _message: PhantomData<fn() -> M>,
}

impl<M, E, D> FnMarshal<M, E, D>
where
    E: Fn(&M) -> Result<Frame, ProtocolError>,
    D: Fn(&Frame) -> Result<M, ProtocolError>,
{
    pub fn new(encode: E, decode: D) -> Self {
        Self {
            encode,
            decode,
            _message: PhantomData,
        }
    }
}

impl<M, E, D> Marshal for FnMarshal<M, E, D>
where
    M: Send + 'static,
    E: Fn(&M) -> Result<Frame, ProtocolError> + Send + Sync + 'static,
    D: Fn(&Frame) -> Result<M, ProtocolError> + Send + Sync + 'static,
{
    type Message = M;

    fn marshal(&self, message: &M) -> Result<Frame, ProtocolError> {
        (self.encode)(message)
    }

    fn unmarshal(&self, frame: &Frame) -> Result<M, ProtocolError> {
        (self.decode)(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        name: String,
        count: u32,
    }

    #[test]
    fn test_raw_marshal() {
        let marshal = RawMarshal::new(3);
        let frame = marshal.marshal(&Bytes::from_static(b"abc")).unwrap();
        assert_eq!(frame.operation(), 3);
        assert_eq!(marshal.unmarshal(&frame).unwrap().as_ref(), b"abc");
    }

    #[test]
    fn test_json_marshal() {
        let marshal = JsonMarshal::<Greeting>::new(9);
        let msg = Greeting {
            name: "hello".into(),
            count: 2,
        };
        let frame = marshal.marshal(&msg).unwrap();
        assert_eq!(frame.operation(), 9);
        assert_eq!(marshal.unmarshal(&frame).unwrap(), msg);
    }

    #[test]
    fn test_json_marshal_rejects_other_operation() {
        let marshal = JsonMarshal::<Greeting>::new(9);
        let frame = Frame::new(10, Bytes::from_static(b"{}"));
        assert!(matches!(
            marshal.unmarshal(&frame),
            Err(ProtocolError::Marshal(_))
        ));
    }

    #[test]
    fn test_json_marshal_bad_body() {
        let marshal = JsonMarshal::<Greeting>::new(9);
        let frame = Frame::new(9, Bytes::from_static(b"not json"));
        assert!(matches!(marshal.unmarshal(&frame), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_fn_marshal() {
        let marshal = FnMarshal::new(
            |n: &u32| Ok(Frame::new(1, n.to_be_bytes().to_vec())),
            |frame: &Frame| {
                let raw: [u8; 4] = frame.body.as_ref().try_into().map_err(|_| {
                    ProtocolError::Marshal(format!("bad body length {}", frame.body.len()))
                })?;
                Ok(u32::from_be_bytes(raw))
            },
        );
        let frame = marshal.marshal(&0xdead_beef).unwrap();
        assert_eq!(marshal.unmarshal(&frame).unwrap(), 0xdead_beef);
        assert!(marshal.unmarshal(&Frame::new(1, vec![1u8])).is_err());
    }
}
