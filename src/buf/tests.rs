use crate::proto::Endianness;

use super::{padding_to, OwnedBuf, ReadBuf};

#[test]
fn padding() {
    assert_eq!(padding_to(0, 8), 0);
    assert_eq!(padding_to(1, 8), 7);
    assert_eq!(padding_to(8, 8), 0);
    assert_eq!(padding_to(9, 4), 3);
    assert_eq!(padding_to(3, 1), 0);
}

#[test]
fn store_aligns_and_zeroes() {
    let mut buf = OwnedBuf::with_endianness(Endianness::LITTLE);
    buf.store(0xffu8);
    buf.store(0x0102u16);
    buf.store(0x03040506u32);

    assert_eq!(buf.get(), &[0xff, 0, 0x02, 0x01, 0x06, 0x05, 0x04, 0x03]);
}

#[test]
fn big_endian_store() {
    let mut buf = OwnedBuf::with_endianness(Endianness::BIG);
    buf.store(0x01020304u32);

    assert_eq!(buf.get(), &[1, 2, 3, 4]);
}

#[test]
fn alloc_backpatch() {
    let mut buf = OwnedBuf::with_endianness(Endianness::LITTLE);
    buf.store(1u8);
    let at = buf.alloc_u32();
    buf.extend_from_slice(b"xy");
    buf.store_at(at, 2);

    assert_eq!(buf.get(), &[1, 0, 0, 0, 2, 0, 0, 0, b'x', b'y']);
}

#[test]
fn load_round_trip() {
    let mut buf = OwnedBuf::with_endianness(Endianness::BIG);
    buf.store(1u8);
    buf.store(-2i16);
    buf.store(3u64);
    buf.store(4.5f64);

    let mut read = ReadBuf::from_slice(buf.get(), Endianness::BIG);
    assert_eq!(read.load::<u8>().unwrap(), 1);
    assert_eq!(read.load::<i16>().unwrap(), -2);
    assert_eq!(read.load::<u64>().unwrap(), 3);
    assert_eq!(read.load::<f64>().unwrap(), 4.5);
    assert!(read.is_empty());
}

#[test]
fn nonzero_padding_rejected() {
    // A u32 at offset 1 requires three zero bytes of padding.
    let mut read = ReadBuf::from_slice(&[1, 0xaa, 0, 0, 1, 0, 0, 0], Endianness::LITTLE);
    assert_eq!(read.load::<u8>().unwrap(), 1);
    assert!(read.load::<u32>().is_err());
}

#[test]
fn slice_nul() {
    let mut read = ReadBuf::from_slice(b"foo\0", Endianness::LITTLE);
    assert_eq!(read.load_slice_nul(3).unwrap(), b"foo");
    assert!(read.is_empty());

    let mut read = ReadBuf::from_slice(b"foo!", Endianness::LITTLE);
    assert!(read.load_slice_nul(3).is_err());

    let mut read = ReadBuf::from_slice(b"f\0o\0", Endianness::LITTLE);
    assert!(read.load_slice_nul(3).is_err());
}

#[test]
fn underflow() {
    let mut read = ReadBuf::from_slice(&[1, 2], Endianness::LITTLE);
    assert!(read.load::<u32>().is_err());
}
