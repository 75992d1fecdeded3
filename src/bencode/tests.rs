use bytes::Bytes;

use super::*;

#[test]
fn test_decode_integer() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
    assert_eq!(decode(b"i-42e").unwrap(), Value::Integer(-42));
    assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
}

#[test]
fn test_decode_integer_invalid() {
    assert!(decode(b"i-0e").is_err());
    assert!(decode(b"i03e").is_err());
    assert!(decode(b"ie").is_err());
    assert!(decode(b"i12").is_err());
}

#[test]
fn test_decode_bytes() {
    assert_eq!(
        decode(b"4:spam").unwrap(),
        Value::Bytes(Bytes::from_static(b"spam"))
    );
    assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Bytes::new()));
    assert!(matches!(
        decode(b"10:short"),
        Err(BencodeError::UnexpectedEof(_))
    ));
}

#[test]
fn test_decode_dict() {
    let value = decode(b"d3:cow3:moo4:spaml1:a1:bee").unwrap();
    assert_eq!(value.get(b"cow").and_then(|v| v.as_str()), Some("moo"));
    assert_eq!(value.get(b"spam").and_then(|v| v.as_list()).map(|l| l.len()), Some(2));
    assert!(value.get(b"missing").is_none());
}

#[test]
fn test_decode_dict_rejects_integer_key() {
    assert_eq!(decode(b"di1e3:mooe"), Err(BencodeError::NonStringKey));
}

#[test]
fn test_trailing_data_error() {
    assert_eq!(decode(b"i42eextra"), Err(BencodeError::TrailingData));
}

#[test]
fn test_decode_prefix_leaves_trailing_payload() {
    let mut data = b"d8:msg_typei1e5:piecei0ee".to_vec();
    data.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

    let (value, used) = decode_prefix(&data).unwrap();
    assert_eq!(value.get(b"msg_type").and_then(|v| v.as_integer()), Some(1));
    assert_eq!(&data[used..], &[0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn test_nesting_limit() {
    let mut deep = vec![b'l'; 100];
    deep.extend(vec![b'e'; 100]);
    assert_eq!(decode(&deep), Err(BencodeError::NestingTooDeep));
}

#[test]
fn test_encode_is_canonical() {
    let original = b"d8:announce15:http://test.com4:infod4:name4:test12:piece lengthi16384eee";
    let decoded = decode(original).unwrap();
    assert_eq!(encode(&decoded), original);
}

#[test]
fn test_dict_builder_sorts_keys() {
    let value = DictBuilder::new()
        .put("y", "q")
        .raw("t", b"aa")
        .put_opt("z", None::<i64>)
        .build();
    assert_eq!(encode(&value), b"d1:t2:aa1:y1:qe");
}

#[test]
fn test_get_20() {
    let value = DictBuilder::new()
        .raw("id", &[7u8; 20])
        .raw("short", &[1u8; 4])
        .build();
    assert_eq!(value.get_20(b"id"), Some([7u8; 20]));
    assert_eq!(value.get_20(b"short"), None);
}
