//! Host-level errors.
//!
//! Guest-visible failures are numeric status codes (see
//! [`kernel::error`](crate::kernel::error)); the types here only describe
//! problems the host has to deal with, like a malformed executable.

use thiserror::Error;

pub type Result<T> = ::std::result::Result<T, EmuError>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LoadError {
    #[error("executable is too small ({0} bytes)")]
    TooSmall(usize),
    #[error("missing ELF magic")]
    BadMagic,
    #[error("not a little-endian 32-bit MIPS executable")]
    NotMips,
    #[error("unsupported ELF type {0:#06x}")]
    Unsupported(u16),
    #[error("segment {index} lies outside the file or memory")]
    Segment { index: usize },
    #[error("could not reserve {size:#x} bytes at {address:#010x}")]
    NoMemory { address: u32, size: u32 },
    #[error("main thread could not be started: {0:#010x}")]
    MainThread(u32),
}

#[derive(Error, Debug)]
pub enum EmuError {
    #[error("failed to load executable: {0}")]
    Load(#[from] LoadError),
    #[error("input output error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}
