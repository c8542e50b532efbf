#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
#[allow(clippy::cast_possible_wrap)]
pub mod bitwise;

pub mod config;

#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_lossless)]
pub mod cpu;
pub mod debugger;
pub mod error;

#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_precision_loss)]
#[allow(clippy::cast_sign_loss)]
#[allow(clippy::cast_possible_wrap)]
#[allow(clippy::similar_names)]
pub mod gpu;

#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::module_name_repetitions)]
pub mod kernel;

#[allow(clippy::cast_possible_truncation)]
pub mod memory;
pub mod ring_buffer;
pub mod system;
