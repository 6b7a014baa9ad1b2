use deft::{Buffer, Codec, Frame, LengthCodec, LineCodec, EOT};

mod util;

use util::init;

fn decode_all(codec: &mut dyn Codec, mut input: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    while let Some(frame) = codec.try_decode(input).expect("decode failed") {
        frames.push(input[frame.payload.clone()].to_vec());
        input = &input[frame.consumed..];
    }
    frames
}

#[test]
fn line_roundtrip() {
    init();

    let mut codec = LineCodec;
    let mut out = Buffer::new();
    let written = codec.encode(b"hello", &mut out).unwrap();
    assert_eq!(written, 7);
    assert_eq!(out.data(), b"hello\r\n");

    let frame = codec.try_decode(out.data()).unwrap().unwrap();
    assert_eq!(frame.consumed, 7);
    assert_eq!(&out.data()[frame.payload], b"hello");
}

#[test]
fn line_accepts_bare_newline() {
    init();

    let mut codec = LineCodec;
    let frame = codec.try_decode(b"hi\nrest").unwrap().unwrap();
    assert_eq!(frame, Frame { consumed: 3, payload: 0..2 });
}

#[test]
fn line_incomplete() {
    init();

    let mut codec = LineCodec;
    assert!(codec.try_decode(b"no terminator yet").unwrap().is_none());
}

#[test]
fn line_eot_sentinel() {
    init();

    let mut codec = LineCodec;
    let frame = codec.try_decode(&[EOT]).unwrap().unwrap();
    assert_eq!(frame.consumed, 1);
    assert_eq!(frame.payload, 0..1);
}

#[test]
fn line_encode_rejects_newline() {
    init();

    let mut codec = LineCodec;
    let mut out = Buffer::new();
    assert!(codec.encode(b"two\nlines", &mut out).is_err());
    assert!(out.is_empty());
}

#[test]
fn length_roundtrip() {
    init();

    let mut codec = LengthCodec::new();
    let mut out = Buffer::new();
    let written = codec.encode(b"hello", &mut out).unwrap();
    assert_eq!(written, 13);
    assert_eq!(&out.data()[..4], b"mBdT");

    let frame = codec.try_decode(out.data()).unwrap().unwrap();
    assert_eq!(frame.consumed, 13);
    assert_eq!(&out.data()[frame.payload], b"hello");
}

// Feed the header plus a partial payload, then the rest.
#[test]
fn length_fragmented_delivery() {
    init();

    let mut codec = LengthCodec::new();
    let mut stream = Vec::new();
    stream.extend_from_slice(b"mBdT");
    stream.extend_from_slice(&5i32.to_be_bytes());
    stream.extend_from_slice(b"he");
    assert!(codec.try_decode(&stream).unwrap().is_none());

    stream.extend_from_slice(b"llo");
    let frame = codec.try_decode(&stream).unwrap().unwrap();
    assert_eq!(frame.consumed, 13);
    assert_eq!(&stream[frame.payload], b"hello");
}

#[test]
fn length_rejects_bad_magic() {
    init();

    let mut codec = LengthCodec::new();
    assert!(codec.try_decode(b"nope\x00\x00\x00\x05hello").is_err());
}

#[test]
fn length_rejects_bad_lengths() {
    init();

    let mut codec = LengthCodec::with_max_frame(16);

    let mut zero = Vec::from(&b"mBdT"[..]);
    zero.extend_from_slice(&0i32.to_be_bytes());
    assert!(codec.try_decode(&zero).is_err());

    let mut negative = Vec::from(&b"mBdT"[..]);
    negative.extend_from_slice(&(-1i32).to_be_bytes());
    assert!(codec.try_decode(&negative).is_err());

    let mut huge = Vec::from(&b"mBdT"[..]);
    huge.extend_from_slice(&17i32.to_be_bytes());
    assert!(codec.try_decode(&huge).is_err());
}

#[test]
fn length_encode_rejects_oversize() {
    init();

    let mut codec = LengthCodec::with_max_frame(4);
    let mut out = Buffer::new();
    assert!(codec.encode(b"hello", &mut out).is_err());
}

// A concatenated stream of encoded frames decodes back to the same frames.
#[test]
fn concatenated_streams() {
    init();

    let payloads: Vec<Vec<u8>> = (0..16)
        .map(|i| {
            let len = 1 + (i * 37) % 300;
            (0..len).map(|_| rand::random::<u8>()).collect()
        })
        .collect();

    let mut codec = LengthCodec::new();
    let mut wire = Buffer::new();
    for payload in &payloads {
        codec.encode(payload, &mut wire).unwrap();
    }
    assert_eq!(decode_all(&mut codec, wire.data()), payloads);

    let lines: Vec<Vec<u8>> = vec![b"one".to_vec(), b"two".to_vec(), b"".to_vec()];
    let mut codec = LineCodec;
    let mut wire = Buffer::new();
    for line in &lines {
        codec.encode(line, &mut wire).unwrap();
    }
    assert_eq!(decode_all(&mut codec, wire.data()), lines);
}

#[test]
fn clone_boxed_is_independent() {
    init();

    let codec = LengthCodec::with_max_frame(8);
    let mut other = codec.clone_boxed();
    let mut out = Buffer::new();
    // The clone carries the same parameters.
    assert!(other.encode(b"123456789", &mut out).is_err());
    assert!(other.encode(b"12345678", &mut out).is_ok());
}
