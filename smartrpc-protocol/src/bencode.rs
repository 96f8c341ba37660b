//! Bencode values.
//!
//! Protocol version three encodes headers as a bencoded dict and argument
//! tuples as bencoded lists.

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Maximum nesting depth accepted by the decoder.
const MAX_DEPTH: usize = 64;

/// A bencoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Builds a list of byte strings, the shape of every argument tuple.
    pub fn from_args(args: &[Bytes]) -> Self {
        Value::List(args.iter().cloned().map(Value::Bytes).collect())
    }

    /// Converts a list into an argument tuple.
    ///
    /// Integers are rendered as decimal ASCII so callers only ever see byte
    /// strings, matching the V1/V2 wire representation.
    pub fn into_args(self) -> Result<Vec<Bytes>, ProtocolError> {
        let items = match self {
            Value::List(items) => items,
            _ => return Err(ProtocolError::BadStructure { expected: "list" }),
        };
        items
            .into_iter()
            .map(|item| match item {
                Value::Bytes(b) => Ok(b),
                Value::Int(i) => Ok(Bytes::from(i.to_string())),
                _ => Err(ProtocolError::BadStructure {
                    expected: "flat list of strings",
                }),
            })
            .collect()
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Appends the bencoded form of this value to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Value::Int(i) => {
                buf.put_u8(b'i');
                buf.put_slice(i.to_string().as_bytes());
                buf.put_u8(b'e');
            }
            Value::Bytes(b) => encode_bytes(b, buf),
            Value::List(items) => {
                buf.put_u8(b'l');
                for item in items {
                    item.encode(buf);
                }
                buf.put_u8(b'e');
            }
            Value::Dict(entries) => {
                buf.put_u8(b'd');
                for (key, value) in entries {
                    encode_bytes(key, buf);
                    value.encode(buf);
                }
                buf.put_u8(b'e');
            }
        }
    }

    /// Returns the bencoded form of this value.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes exactly one value occupying all of `data`.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut parser = Parser { data, pos: 0 };
        let value = parser.value(0)?;
        if parser.pos != data.len() {
            return Err(bad(format!(
                "{} trailing bytes after value",
                data.len() - parser.pos
            )));
        }
        Ok(value)
    }
}

fn encode_bytes(b: &[u8], buf: &mut BytesMut) {
    buf.put_slice(b.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(b);
}

fn bad(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::Bencode(msg.into())
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8, ProtocolError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| bad("unexpected end of data"))
    }

    fn value(&mut self, depth: usize) -> Result<Value, ProtocolError> {
        if depth > MAX_DEPTH {
            return Err(bad("nesting too deep"));
        }
        match self.peek()? {
            b'i' => {
                self.pos += 1;
                let digits = self.until(b'e')?;
                Ok(Value::Int(parse_int(digits)?))
            }
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut entries = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = self.string()?;
                    let value = self.value(depth + 1)?;
                    entries.insert(key, value);
                }
                self.pos += 1;
                Ok(Value::Dict(entries))
            }
            b'0'..=b'9' => Ok(Value::Bytes(self.string()?)),
            other => Err(bad(format!("unexpected byte {:#04x}", other))),
        }
    }

    fn string(&mut self) -> Result<Bytes, ProtocolError> {
        let digits = self.until(b':')?;
        if digits.is_empty() || (digits.len() > 1 && digits[0] == b'0') {
            return Err(bad("malformed string length"));
        }
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| bad("malformed string length"))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| bad("string runs past end of data"))?;
        let s = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(s)
    }

    /// Returns the bytes up to `delim` and moves past it.
    fn until(&mut self, delim: u8) -> Result<&'a [u8], ProtocolError> {
        let rest = &self.data[self.pos..];
        let idx = rest
            .iter()
            .position(|&b| b == delim)
            .ok_or_else(|| bad("unterminated token"))?;
        self.pos += idx + 1;
        Ok(&rest[..idx])
    }
}

fn parse_int(digits: &[u8]) -> Result<i64, ProtocolError> {
    let s = std::str::from_utf8(digits).map_err(|_| bad("malformed integer"))?;
    let unsigned = s.strip_prefix('-').unwrap_or(s);
    if unsigned.is_empty()
        || (unsigned.len() > 1 && unsigned.starts_with('0'))
        || s == "-0"
        || !unsigned.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(bad(format!("malformed integer {:?}", s)));
    }
    s.parse().map_err(|_| bad(format!("integer out of range {:?}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_encode_known_forms() {
        assert_eq!(Value::Int(42).to_bytes(), b("i42e"));
        assert_eq!(Value::Int(-7).to_bytes(), b("i-7e"));
        assert_eq!(Value::Bytes(b("spam")).to_bytes(), b("4:spam"));
        assert_eq!(
            Value::from_args(&[b("Branch.get_parent"), b("quack/")]).to_bytes(),
            b("l17:Branch.get_parent6:quack/e")
        );
    }

    #[test]
    fn test_dict_keys_are_sorted() {
        let mut d = BTreeMap::new();
        d.insert(b("zeta"), Value::Int(1));
        d.insert(b("Software version"), Value::Bytes(b("2.6")));
        assert_eq!(
            Value::Dict(d).to_bytes(),
            b("d16:Software version3:2.64:zetai1ee")
        );
    }

    #[test]
    fn test_decode_rejects_malformed() {
        for input in [
            &b"i03e"[..],
            b"i-0e",
            b"ie",
            b"5:abc",
            b"l4:spam",
            b"4:spamx",
            b"x",
            b"",
            b"d3:fooe",
            b"01:a",
        ] {
            assert!(Value::decode(input).is_err(), "accepted {:?}", input);
        }
    }

    #[test]
    fn test_decode_nested() {
        let v = Value::decode(b"l2:okli1e1:xee").unwrap();
        assert_eq!(
            v,
            Value::List(vec![
                Value::Bytes(b("ok")),
                Value::List(vec![Value::Int(1), Value::Bytes(b("x"))]),
            ])
        );
    }

    #[test]
    fn test_decode_depth_limit() {
        let mut data = vec![b'l'; MAX_DEPTH + 2];
        data.extend(vec![b'e'; MAX_DEPTH + 2]);
        assert!(Value::decode(&data).is_err());
    }

    #[test]
    fn test_into_args_renders_ints() {
        let v = Value::decode(b"l2:oki12ee").unwrap();
        assert_eq!(v.into_args().unwrap(), vec![b("ok"), b("12")]);

        let nested = Value::decode(b"l2:okl1:xee").unwrap();
        assert!(nested.into_args().is_err());
        assert!(Value::Int(1).into_args().is_err());
    }

    fn value_strategy() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(Value::Int),
            proptest::collection::vec(any::<u8>(), 0..32).prop_map(|v| Value::Bytes(Bytes::from(v))),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
                proptest::collection::btree_map(
                    proptest::collection::vec(any::<u8>(), 0..8).prop_map(Bytes::from),
                    inner,
                    0..6
                )
                .prop_map(Value::Dict),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(value in value_strategy()) {
            let encoded = value.to_bytes();
            prop_assert_eq!(Value::decode(&encoded).unwrap(), value);
        }

        #[test]
        fn prop_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Value::decode(&data);
        }
    }
}
