// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! LSB-first bit packing used by both debug transports.
//!
//! Scan data on the debug link is a flat run of bits with no alignment between fields, the first
//! bit sent being bit 0 of the first field. [`BitWriter`] lays fields out that way one after the
//! other, and [`BitReader`] takes them back off again in the same order.

use bitvec::prelude::*;

pub type ScanBits = BitVec<u8, Lsb0>;

#[derive(Debug, Default, Clone)]
pub struct BitWriter
{
	bits: ScanBits,
}

impl BitWriter
{
	pub fn new() -> Self
	{
		Self::default()
	}

	/// Append the low `width` bits of `value`, least significant bit first
	pub fn push(&mut self, value: u64, width: usize) -> &mut Self
	{
		debug_assert!(width > 0 && width <= 64, "field width {} out of range", width);
		let mask = if width == 64 {
			u64::MAX
		} else {
			(1u64 << width) - 1
		};
		let start = self.bits.len();
		self.bits.resize(start + width, false);
		self.bits[start..].store_le(value & mask);
		self
	}

	pub fn len(&self) -> usize
	{
		self.bits.len()
	}

	pub fn is_empty(&self) -> bool
	{
		self.bits.is_empty()
	}

	pub fn as_bits(&self) -> &BitSlice<u8, Lsb0>
	{
		&self.bits
	}

	pub fn into_bits(self) -> ScanBits
	{
		self.bits
	}

	/// Turn the packed bits into bytes, padding the final byte out with zeros
	pub fn into_bytes(mut self) -> Vec<u8>
	{
		self.bits.set_uninitialized(false);
		self.bits.into_vec()
	}
}

#[derive(Debug, Clone)]
pub struct BitReader<'a>
{
	bits: &'a BitSlice<u8, Lsb0>,
	position: usize,
}

impl<'a> BitReader<'a>
{
	pub fn new(bits: &'a BitSlice<u8, Lsb0>) -> Self
	{
		Self {
			bits,
			position: 0,
		}
	}

	pub fn from_bytes(bytes: &'a [u8]) -> Self
	{
		Self::new(bytes.view_bits::<Lsb0>())
	}

	/// Take the next `width` bits as a value. Bits beyond the end of the underlying data read as 0
	pub fn take(&mut self, width: usize) -> u64
	{
		debug_assert!(width > 0 && width <= 64, "field width {} out of range", width);
		let start = self.position.min(self.bits.len());
		let end = (self.position + width).min(self.bits.len());
		self.position += width;
		if start == end {
			0
		} else {
			self.bits[start..end].load_le::<u64>()
		}
	}

	pub fn skip(&mut self, width: usize) -> &mut Self
	{
		self.position += width;
		self
	}

	pub fn remaining(&self) -> usize
	{
		self.bits.len().saturating_sub(self.position)
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn fields_pack_lsb_first()
	{
		let mut writer = BitWriter::new();
		writer.push(0b10, 2).push(0xff, 8).push(0b1, 1);
		assert_eq!(writer.len(), 11);
		// 2 bits of 0b10, then 6 of the 0xff's bits fill out the first byte
		assert_eq!(writer.into_bytes(), vec![0b1111_1110, 0b0000_0111]);
	}

	#[test]
	fn oversized_values_are_masked()
	{
		let mut writer = BitWriter::new();
		writer.push(0xffff, 4).push(0, 4);
		assert_eq!(writer.into_bytes(), vec![0x0f]);
	}

	#[test]
	fn fields_straddling_bytes_read_back()
	{
		let mut writer = BitWriter::new();
		writer.push(3, 2).push(0x0123_4567_89ab_cdef, 64).push(0xa5, 8);
		let bytes = writer.into_bytes();
		assert_eq!(bytes.len(), 10);

		let mut reader = BitReader::from_bytes(&bytes);
		assert_eq!(reader.take(2), 3);
		assert_eq!(reader.take(64), 0x0123_4567_89ab_cdef);
		assert_eq!(reader.take(8), 0xa5);
		assert_eq!(reader.remaining(), 6);
	}

	#[test]
	fn reading_past_the_end_yields_zeros()
	{
		let bytes = [0xffu8];
		let mut reader = BitReader::from_bytes(&bytes);
		reader.skip(4);
		assert_eq!(reader.take(8), 0x0f);
		assert_eq!(reader.take(8), 0);
		assert_eq!(reader.remaining(), 0);
	}
}
