//! Position-tracked binary reading and writing.
//!
//! Resource tables and compiled XML are little-endian; the endianness is
//! picked by the caller, never sniffed from the data.

mod input;
mod output;

pub use input::ExtDataInput;
pub use output::ExtDataOutput;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Endian {
    #[default]
    Little,
    Big,
}
