use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid string length at byte {0}")]
    InvalidStringLength(usize),

    #[error("unexpected byte {byte:#04x} at {pos}")]
    UnexpectedByte { byte: u8, pos: usize },

    #[error("dictionary key must be a byte string")]
    NonStringKey,

    #[error("trailing data after value")]
    TrailingData,

    #[error("nesting too deep")]
    NestingTooDeep,
}
