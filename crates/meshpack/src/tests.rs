use crate::*;

// ============================================================================
//  SCALARS
// ============================================================================

#[test]
fn test_scalars_are_big_endian() {
    let mut enc = Encoder::new();
    enc.i16(0x0102);
    enc.i32(0x0304_0506);
    enc.i64(0x0708_090A_0B0C_0D0E);
    enc.bool(true);

    assert_eq!(
        enc.as_bytes(),
        &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 1]
    );
}

#[test]
fn test_scalar_extremes() -> Result<()> {
    let mut enc = Encoder::new();
    enc.i16(i16::MIN);
    enc.i32(i32::MAX);
    enc.i32(-1);
    enc.i64(i64::MIN);
    enc.bool(false);

    let bytes = enc.into_bytes();
    let mut cur = Cursor::new(&bytes);
    assert_eq!(cur.i16()?, i16::MIN);
    assert_eq!(cur.i32()?, i32::MAX);
    assert_eq!(cur.i32()?, -1);
    assert_eq!(cur.i64()?, i64::MIN);
    assert!(!cur.bool()?);
    cur.expect_end()
}

#[test]
fn test_invalid_bool() {
    let mut cur = Cursor::new(&[2]);
    assert_eq!(cur.bool(), Err(Error::InvalidBool(2)));
}

#[test]
fn test_short_read_reports_missing_bytes() {
    let mut cur = Cursor::new(&[0, 0]);
    assert_eq!(cur.i32(), Err(Error::Pending(2)));
    assert_eq!(cur.pos(), 0);
}

// ============================================================================
//  BLOBS, STRINGS, LISTS
// ============================================================================

#[test]
fn test_blob_and_list() -> Result<()> {
    let mut enc = Encoder::new();
    enc.blob(b"payload")?;
    enc.i32_list(&[7, -3, 1 << 20])?;
    enc.str("room-1")?;

    let bytes = enc.into_bytes();
    let mut cur = Cursor::new(&bytes);
    assert_eq!(cur.blob()?, b"payload");
    assert_eq!(cur.i32_list()?, vec![7, -3, 1 << 20]);
    assert_eq!(cur.str()?, "room-1");
    cur.expect_end()
}

#[test]
fn test_empty_blob() -> Result<()> {
    let mut enc = Encoder::new();
    enc.blob(&[])?;
    assert_eq!(enc.as_bytes(), &[0, 0, 0, 0]);

    let bytes = enc.into_bytes();
    let mut cur = Cursor::new(&bytes);
    assert!(cur.blob()?.is_empty());
    Ok(())
}

#[test]
fn test_negative_blob_length() {
    let bytes = (-5i32).to_be_bytes();
    let mut cur = Cursor::new(&bytes);
    assert_eq!(cur.blob(), Err(Error::NegativeLength(-5)));
}

#[test]
fn test_truncated_list() {
    let mut enc = Encoder::new();
    enc.i16(3);
    enc.i32(1);
    let bytes = enc.into_bytes();
    let mut cur = Cursor::new(&bytes);
    assert!(matches!(cur.i32_list(), Err(Error::Pending(8))));
}

#[test]
fn test_list_too_long_for_prefix() {
    let items = vec![0i32; i16::MAX as usize + 1];
    let mut enc = Encoder::new();
    assert_eq!(enc.i32_list(&items), Err(Error::TooLong(items.len())));
    assert!(enc.is_empty());
}

#[test]
fn test_trailing_bytes() {
    let cur = Cursor::new(&[1, 2, 3]);
    assert_eq!(cur.expect_end(), Err(Error::Trailing(3)));
}

// ============================================================================
//  FRAMES
// ============================================================================

#[test]
fn test_frame_layout() -> Result<()> {
    let frame = Frame::new(11, -4, vec![0xAA, 0xBB]);
    let bytes = frame.encode()?;

    assert_eq!(
        bytes,
        vec![0, 0, 0, 10, 0, 0, 0, 11, 0xFF, 0xFF, 0xFF, 0xFC, 0xAA, 0xBB]
    );
    assert_eq!(Frame::decode(&bytes)?, frame);
    Ok(())
}

#[test]
fn test_frame_with_empty_body() -> Result<()> {
    let frame = Frame::new(3, 0, Vec::new());
    let bytes = frame.encode()?;
    assert_eq!(bytes.len(), 12);
    assert_eq!(Frame::decode(&bytes)?, frame);
    Ok(())
}

#[test]
fn test_frame_too_short() {
    let bytes = 4i32.to_be_bytes();
    assert_eq!(Frame::decode(&bytes), Err(Error::FrameTooShort(4)));
}

#[test]
fn test_frame_buffer_reassembles_chunks() -> Result<()> {
    let a = Frame::new(1, 1, b"first".to_vec());
    let b = Frame::new(2, -1, b"second frame".to_vec());

    let mut stream = a.encode()?;
    stream.extend(b.encode()?);

    let mut buffer = FrameBuffer::new();
    let mut decoded = Vec::new();
    for chunk in stream.chunks(5) {
        buffer.extend(chunk);
        while let Some(frame) = buffer.next_frame()? {
            decoded.push(frame);
        }
    }

    assert_eq!(decoded, vec![a, b]);
    assert!(buffer.is_empty());
    Ok(())
}

#[test]
fn test_frame_buffer_waits_for_header() -> Result<()> {
    let mut buffer = FrameBuffer::new();
    buffer.extend(&[0, 0]);
    assert_eq!(buffer.next_frame()?, None);
    assert_eq!(buffer.len(), 2);
    Ok(())
}

#[test]
fn test_frame_buffer_rejects_oversized_frame() {
    let mut buffer = FrameBuffer::with_max_frame(64);
    buffer.extend(&1000i32.to_be_bytes());
    assert_eq!(buffer.next_frame(), Err(Error::FrameTooLarge(1000)));
}
