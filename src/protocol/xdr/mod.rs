//! XDR (External Data Representation, RFC 4506) encoding for the parts of
//! ONC RPC this client speaks.
//!
//! Every XDR item is a multiple of four bytes and big endian. The engine only
//! needs the basic building blocks: unsigned and signed 32-bit integers,
//! booleans and enums, variable-length opaque data (credentials, verifiers) and
//! counted arrays (supplementary group lists). Anything procedure specific is
//! carried as opaque bytes and left to the caller.
//!
//! Rust types stand in for the XDR ones: `unsigned int` is `u32`, `int` is
//! `i32`, `opaque<>` is `Vec<u8>` / `[u8]`, `unsigned int<>` is `Vec<u32>`.

use std::io::{Read, Write};

use byteorder::BigEndian;
use byteorder::{ReadBytesExt, WriteBytesExt};
use num_traits::{FromPrimitive, ToPrimitive};

pub mod mount;
pub mod nfs3;
pub mod rpc;
pub(crate) mod utils;

/// XDR assumes big endian encoding.
pub type XDREndian = BigEndian;

pub trait Serialize {
    /// Writes the XDR form of `self` to `dest`.
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()>;
}

pub trait Deserialize {
    /// Overwrites `self` with a value read from `src`.
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()>;
}

/// Reads a fresh `T` from `src`, starting from `T::default()`.
pub fn deserialize<T>(src: &mut impl Read) -> std::io::Result<T>
where
    T: Deserialize + Default,
{
    let mut val = T::default();
    val.deserialize(src)?;

    Ok(val)
}

/// Marker trait for XDR `enum` serialization.
pub trait SerializeEnum: ToPrimitive {}

/// Enumerations share the representation of signed integers.
impl<T: SerializeEnum> Serialize for T {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        if let Some(val) = self.to_i32() {
            return dest.write_i32::<XDREndian>(val);
        }
        Err(utils::invalid_data("Invalid enum value"))
    }
}

/// Marker trait for XDR `enum` deserialization.
pub trait DeserializeEnum: FromPrimitive {}

impl<T: DeserializeEnum> Deserialize for T {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let val = src.read_i32::<XDREndian>()?;
        if let Some(val) = FromPrimitive::from_i32(val) {
            *self = val;
            return Ok(());
        }

        Err(utils::invalid_data("Invalid enum value"))
    }
}

/// `bool` travels as the enum `{ FALSE = 0, TRUE = 1 }`.
impl Serialize for bool {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_i32::<XDREndian>(if *self { 1 } else { 0 })
    }
}

impl Deserialize for bool {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        match src.read_i32::<XDREndian>()? {
            0 => *self = false,
            1 => *self = true,
            _ => return Err(utils::invalid_data("Invalid value for bool enum")),
        }
        Ok(())
    }
}

/// `int` and `unsigned int` go straight through `byteorder`.
macro_rules! xdr_word {
    ($t:ty, $write:ident, $read:ident) => {
        impl Serialize for $t {
            fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
                dest.$write::<XDREndian>(*self)
            }
        }

        impl Deserialize for $t {
            fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
                *self = src.$read::<XDREndian>()?;
                Ok(())
            }
        }
    };
}

xdr_word!(i32, write_i32, read_i32);
xdr_word!(u32, write_u32, read_u32);

/// Lengths on the wire are `u32`; this wrapper carries a `usize` across.
#[derive(Default)]
struct UsizeAsU32(usize);

impl Serialize for UsizeAsU32 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        let Some(val) = self.0.to_u32() else {
            return Err(utils::invalid_data("cannot cast `usize` to `u32`"));
        };

        val.serialize(dest)
    }
}

impl Deserialize for UsizeAsU32 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let Some(val) = deserialize::<u32>(src)?.to_usize() else {
            return Err(utils::invalid_data("cannot cast `u32` to `usize`"));
        };

        self.0 = val;
        Ok(())
    }
}

/// Variable-length opaque data: length, bytes, zero padding to four.
impl Serialize for [u8] {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        UsizeAsU32(self.len()).serialize(dest)?;
        dest.write_all(self)?;
        utils::write_padding(self.len(), dest)?;

        Ok(())
    }
}

impl Serialize for Vec<u8> {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.as_slice().serialize(dest)
    }
}

impl Deserialize for Vec<u8> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let length = deserialize::<UsizeAsU32>(src)?.0;
        self.clear();
        // the declared length is untrusted; only what the input holds is allocated
        src.by_ref().take(length as u64).read_to_end(self)?;
        if self.len() < length {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        utils::read_padding(length, src)?;

        Ok(())
    }
}

/// Counted array of 32-bit unsigned integers (`unsigned int gids<16>`).
impl Serialize for Vec<u32> {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        UsizeAsU32(self.len()).serialize(dest)?;
        for i in self {
            i.serialize(dest)?;
        }

        Ok(())
    }
}

impl Deserialize for Vec<u32> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let length = deserialize::<UsizeAsU32>(src)?.0;
        self.clear();
        for _ in 0..length {
            self.push(deserialize::<u32>(src)?);
        }
        Ok(())
    }
}

/// Implements [`Serialize`] for a struct by writing its fields in order.
#[allow(non_camel_case_types)]
#[macro_export]
macro_rules! SerializeStruct {
    (
        $t:ident,
        $($element:ident),*
    ) => {
        impl Serialize for $t {
            fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
                $(self.$element.serialize(dest)?;)*
                Ok(())
            }
        }
    };
}

/// Implements [`Deserialize`] for a struct by reading its fields in order.
#[allow(non_camel_case_types)]
#[macro_export]
macro_rules! DeserializeStruct {
    (
        $t:ident,
        $($element:ident),*
    ) => {
        impl Deserialize for $t {
            fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
                $(self.$element.deserialize(src)?;)*
                Ok(())
            }
        }
    };
}

pub use crate::DeserializeStruct;
pub use crate::SerializeStruct;
