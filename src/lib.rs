//! Streaming (de)serialisation of D-Bus argument payloads.
//!
//! An [`Arguments`] value pairs a type signature with an aligned payload
//! buffer. A [`Writer`] cursor builds such a value from a sequence of typed
//! calls; a [`Reader`] cursor walks an existing value, decoding fields in
//! strict signature order. Both cursors are driven by inspecting
//! [`state()`](Reader::state) and calling the matching transition.
//!
//! ```rust
//! use dbus_args::{Arguments, CursorState};
//!
//! let scratch = Arguments::default();
//! let mut writer = scratch.begin_write().unwrap();
//! writer.write_byte(23);
//! writer.write_string("hello");
//! let message = writer.finish();
//! assert_eq!(message.signature(), &b"ys"[..]);
//!
//! let mut reader = message.begin_read().unwrap();
//! assert_eq!(reader.state(), CursorState::Byte);
//! assert_eq!(reader.read_byte(), 23);
//! assert_eq!(reader.read_string(), "hello");
//! assert_eq!(reader.state(), CursorState::Finished);
//! ```
//!
//! The reader is restartable: when the payload is truncated it reports
//! [`CursorState::NeedMoreData`] without consuming anything, and
//! [`Reader::replace_data`] retries the pending transition once more bytes
//! have arrived. Both cursors turn any grammar violation or misuse into the
//! terminal [`CursorState::InvalidData`] instead of panicking.

use std::cell::Cell;
use std::fmt;

pub use crate::error::{Error, ErrorKind, Result};
pub use crate::reader::Reader;
pub use crate::signature::{
    is_object_path_valid, is_signature_valid, is_string_valid, SignatureType,
};
pub use crate::writer::Writer;

mod basic_io;
pub mod error;
mod reader;
mod signature;
mod writer;


/// The single tag both cursors report from `state()`. It mixes structural
/// positions (`BeginArray`, `NextDictEntry`, ...) with value-ready positions
/// (`Byte`, `String`, ...) and the two terminals `NeedMoreData` (retry after
/// `replace_data`) and `InvalidData` (give up).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CursorState {
    NotStarted,
    Finished,
    NeedMoreData,
    InvalidData,
    AnyData,
    DictKey,
    BeginArray,
    NextArrayEntry,
    EndArray,
    BeginDict,
    NextDictEntry,
    EndDict,
    BeginStruct,
    EndStruct,
    BeginVariant,
    EndVariant,
    Byte,
    Boolean,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
}

impl fmt::Display for CursorState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CursorState::NotStarted => "NotStarted",
            CursorState::Finished => "Finished",
            CursorState::NeedMoreData => "NeedMoreData",
            CursorState::InvalidData => "InvalidData",
            CursorState::AnyData => "AnyData",
            CursorState::DictKey => "DictKey",
            CursorState::BeginArray => "BeginArray",
            CursorState::NextArrayEntry => "NextArrayEntry",
            CursorState::EndArray => "EndArray",
            CursorState::BeginDict => "BeginDict",
            CursorState::NextDictEntry => "NextDictEntry",
            CursorState::EndDict => "EndDict",
            CursorState::BeginStruct => "BeginStruct",
            CursorState::EndStruct => "EndStruct",
            CursorState::BeginVariant => "BeginVariant",
            CursorState::EndVariant => "EndVariant",
            CursorState::Byte => "Byte",
            CursorState::Boolean => "Boolean",
            CursorState::Int16 => "Int16",
            CursorState::Uint16 => "Uint16",
            CursorState::Int32 => "Int32",
            CursorState::Uint32 => "Uint32",
            CursorState::Int64 => "Int64",
            CursorState::Uint64 => "Uint64",
            CursorState::Double => "Double",
            CursorState::String => "String",
            CursorState::ObjectPath => "ObjectPath",
            CursorState::Signature => "Signature",
            CursorState::UnixFd => "UnixFd",
        };
        f.write_str(name)
    }
}

/// An immutable (signature, payload) pair plus the byte-order flag of the
/// payload. Cursors claim an `Arguments` on construction: any number of
/// readers may coexist, a writer is exclusive. Claims are released when the
/// cursor is dropped.
#[derive(Debug)]
pub struct Arguments {
    signature: Vec<u8>,
    data: Vec<u8>,
    is_byte_swapped: bool,
    read_cursors: Cell<u32>,
    has_write_cursor: Cell<bool>,
}

impl Arguments {
    /// Wraps a received signature and payload. Nothing is validated here;
    /// the `Reader` checks the signature grammar on construction and flags
    /// payload problems while decoding.
    pub fn new<S, D>(signature: S, data: D, is_byte_swapped: bool) -> Arguments
    where
        S: Into<Vec<u8>>,
        D: Into<Vec<u8>>,
    {
        Arguments {
            signature: signature.into(),
            data: data.into(),
            is_byte_swapped,
            read_cursors: Cell::new(0),
            has_write_cursor: Cell::new(false),
        }
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_byte_swapped(&self) -> bool {
        self.is_byte_swapped
    }

    /// Claims the value for reading and returns a decoding cursor.
    ///
    /// Fails with [`ErrorKind::WriteCursorActive`] while a writer claims
    /// this value.
    pub fn begin_read(&self) -> Result<Reader> {
        if self.has_write_cursor.get() {
            return Err(Error::new(ErrorKind::WriteCursorActive, None, None));
        }
        self.read_cursors.set(self.read_cursors.get() + 1);
        Ok(Reader::new(self))
    }

    /// Claims the value for writing and returns an encoding cursor.
    ///
    /// Fails with [`ErrorKind::ReadCursorsActive`] or
    /// [`ErrorKind::WriteCursorActive`] while any other cursor claims this
    /// value.
    pub fn begin_write(&self) -> Result<Writer> {
        if self.has_write_cursor.get() {
            return Err(Error::new(ErrorKind::WriteCursorActive, None, None));
        }
        if self.read_cursors.get() > 0 {
            return Err(Error::new(ErrorKind::ReadCursorsActive, None, None));
        }
        self.has_write_cursor.set(true);
        Ok(Writer::new(self))
    }

    pub(crate) fn release_read_claim(&self) {
        let count = self.read_cursors.get();
        debug_assert!(count > 0);
        self.read_cursors.set(count.saturating_sub(1));
    }

    pub(crate) fn release_write_claim(&self) {
        debug_assert!(self.has_write_cursor.get());
        self.has_write_cursor.set(false);
    }
}

impl Default for Arguments {
    fn default() -> Arguments {
        Arguments::new(Vec::new(), Vec::new(), false)
    }
}

impl Clone for Arguments {
    /// Copies are independent: the clone starts without cursor claims.
    fn clone(&self) -> Arguments {
        Arguments::new(
            self.signature.clone(),
            self.data.clone(),
            self.is_byte_swapped,
        )
    }
}

impl PartialEq for Arguments {
    fn eq(&self, other: &Arguments) -> bool {
        self.signature == other.signature
            && self.data == other.data
            && self.is_byte_swapped == other.is_byte_swapped
    }
}
