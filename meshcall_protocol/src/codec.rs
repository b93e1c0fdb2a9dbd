use std::fmt::Debug;

use bytes::BytesMut;
use serde::{de::DeserializeOwned, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::{Error, ErrorKind, Result};

#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, EnumIter, EnumString)]
pub enum SerializeType {
    SerializeNone = 0,
    JSON = 1,
    MsgPack = 3,
}

/// A value that can travel as a call argument or reply.
///
/// `from_slice` decodes into an existing value so callers can hand the
/// dispatch engine a `&mut` output slot.
pub trait MeshParam: Debug {
    fn into_bytes(&self, st: SerializeType) -> Result<Vec<u8>>;
    fn from_slice(&mut self, st: SerializeType, data: &[u8]) -> Result<()>;
}

impl MeshParam for BytesMut {
    fn into_bytes(&self, _: SerializeType) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }
    fn from_slice(&mut self, _: SerializeType, data: &[u8]) -> Result<()> {
        self.clear();
        self.extend_from_slice(data);
        Ok(())
    }
}

pub fn encode<T: Serialize + ?Sized>(value: &T, st: SerializeType) -> Result<Vec<u8>> {
    match st {
        SerializeType::JSON => Ok(serde_json::to_vec(value)?),
        SerializeType::MsgPack => Ok(rmp_serde::to_vec(value)?),
        SerializeType::SerializeNone => Err(Error::new(
            ErrorKind::Serialization,
            "no serializer for typed value",
        )),
    }
}

pub fn decode<T: DeserializeOwned>(st: SerializeType, data: &[u8]) -> Result<T> {
    match st {
        SerializeType::JSON => Ok(serde_json::from_slice(data)?),
        SerializeType::MsgPack => Ok(rmp_serde::from_read_ref(data)?),
        SerializeType::SerializeNone => Err(Error::new(
            ErrorKind::Serialization,
            "no deserializer for typed value",
        )),
    }
}
