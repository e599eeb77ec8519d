use chainerror::prelude::v1::*;

#[derive(Clone, PartialEq, Debug)]
pub enum ErrorKind {
    WriteCursorActive,
    ReadCursorsActive,
    Generic,
}

impl ::std::error::Error for ErrorKind {}

impl ::std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        match self {
            ErrorKind::WriteCursorActive => {
                write!(f, "Arguments: a write cursor already claims this value")
            }
            ErrorKind::ReadCursorsActive => {
                write!(f, "Arguments: read cursors still claim this value")
            }
            ErrorKind::Generic => Ok(()),
        }
    }
}

pub type Result<T> = ChainResult<T, ErrorKind>;
pub type Error = ChainError<ErrorKind>;
