use leech::bencode::{self, Bencode};

#[test]
fn test_decode_int() {
    assert_eq!(bencode::decode(b"i42e").unwrap(), Bencode::Int(42));
    assert_eq!(bencode::decode(b"i-7e").unwrap(), Bencode::Int(-7));
    assert_eq!(bencode::decode(b"i0e").unwrap(), Bencode::Int(0));
}

#[test]
fn test_decode_rejects_bad_ints() {
    assert!(bencode::decode(b"i03e").is_err());
    assert!(bencode::decode(b"i-0e").is_err());
    assert!(bencode::decode(b"ie").is_err());
    assert!(bencode::decode(b"i12").is_err());
}

#[test]
fn test_decode_bytes() {
    assert_eq!(
        bencode::decode(b"4:spam").unwrap(),
        Bencode::Bytes(b"spam".to_vec())
    );
    assert_eq!(bencode::decode(b"0:").unwrap(), Bencode::Bytes(Vec::new()));
    assert!(bencode::decode(b"5:spam").is_err());
    assert!(bencode::decode(b"04:spam").is_err());
}

#[test]
fn test_decode_list() {
    let value = bencode::decode(b"l4:spami7ee").unwrap();
    let list = value.list().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].bytes().unwrap(), b"spam");
    assert_eq!(list[1].int().unwrap(), 7);
}

#[test]
fn test_decode_dict() {
    let value = bencode::decode(b"d3:bar4:spam3:fooi42ee").unwrap();
    let dict = value.dict().unwrap();
    assert_eq!(dict.get(b"bar".as_slice()).unwrap().bytes().unwrap(), b"spam");
    assert_eq!(dict.get(b"foo".as_slice()).unwrap().int().unwrap(), 42);
}

#[test]
fn test_trailing_data_rejected() {
    assert!(bencode::decode(b"i1ejunk").is_err());
}

#[test]
fn test_encode_roundtrip() {
    let raw: &[u8] = b"d4:infod6:lengthi100e4:name4:test12:piece lengthi50eee";
    let value = bencode::decode(raw).unwrap();
    assert_eq!(bencode::encode(&value), raw);
}

#[test]
fn test_wrong_type_accessors() {
    let value = bencode::decode(b"i1e").unwrap();
    assert!(value.bytes().is_err());
    assert!(value.dict().is_err());
    assert!(value.list().is_err());
    assert_eq!(value.int().unwrap(), 1);
}
