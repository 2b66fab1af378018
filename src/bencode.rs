use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

/// A parsed bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

#[derive(Debug)]
pub enum Error {
    Eof,
    Unexpected { byte: u8, pos: usize },
    BadInt(String),
    Trailing(usize),
    BadDictKey(usize),
    WrongType(&'static str),
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Eof => write!(f, "unexpected end of input"),
            Error::Unexpected { byte, pos } => {
                write!(f, "unexpected byte 0x{:02x} at offset {}", byte, pos)
            }
            Error::BadInt(s) => write!(f, "invalid integer: {}", s),
            Error::Trailing(pos) => write!(f, "trailing data at offset {}", pos),
            Error::BadDictKey(pos) => write!(f, "dictionary key is not a string at {}", pos),
            Error::WrongType(want) => write!(f, "bencode value is not {}", want),
            Error::Io(e) => write!(f, "read error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Decodes a single bencode value spanning the whole input.
pub fn decode(bytes: &[u8]) -> Result<Bencode> {
    let mut parser = Parser { data: bytes, pos: 0 };
    let value = parser.value()?;
    if parser.pos != bytes.len() {
        return Err(Error::Trailing(parser.pos));
    }
    Ok(value)
}

/// Reads the whole stream and decodes it as one bencode value.
pub fn decode_from_reader<R: Read>(mut reader: R) -> Result<Bencode> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    decode(&buf)
}

/// Serializes a bencode value back to its canonical byte form.
pub fn encode(value: &Bencode) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Bencode, out: &mut Vec<u8>) {
    match value {
        Bencode::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Bencode::Bytes(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        Bencode::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Bencode::Dict(map) => {
            out.push(b'd');
            for (key, val) in map {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8> {
        self.data.get(self.pos).copied().ok_or(Error::Eof)
    }

    fn bump(&mut self) -> Result<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        let got = self.bump()?;
        if got != byte {
            return Err(Error::Unexpected {
                byte: got,
                pos: self.pos - 1,
            });
        }
        Ok(())
    }

    fn value(&mut self) -> Result<Bencode> {
        match self.peek()? {
            b'i' => self.int(),
            b'l' => self.list(),
            b'd' => self.dict(),
            b'0'..=b'9' => self.byte_string(),
            byte => Err(Error::Unexpected {
                byte,
                pos: self.pos,
            }),
        }
    }

    /// Reads decimal digits up to (not including) `stop`. Leading zeros are
    /// rejected, per the format's canonical-form rules.
    fn digits_until(&mut self, stop: u8, allow_sign: bool) -> Result<&'a [u8]> {
        let start = self.pos;
        if allow_sign && self.peek()? == b'-' {
            self.pos += 1;
        }
        loop {
            let b = self.peek()?;
            if b == stop {
                break;
            }
            if !b.is_ascii_digit() {
                return Err(Error::Unexpected { byte: b, pos: self.pos });
            }
            self.pos += 1;
        }
        let digits = &self.data[start..self.pos];
        self.pos += 1; // consume the stop byte

        let unsigned = if digits.first() == Some(&b'-') {
            &digits[1..]
        } else {
            digits
        };
        if unsigned.is_empty() {
            return Err(Error::BadInt("empty".into()));
        }
        if unsigned[0] == b'0' && unsigned.len() > 1 {
            return Err(Error::BadInt("leading zero".into()));
        }
        if digits[0] == b'-' && unsigned[0] == b'0' {
            return Err(Error::BadInt("negative zero".into()));
        }
        Ok(digits)
    }

    fn int(&mut self) -> Result<Bencode> {
        self.expect(b'i')?;
        let digits = self.digits_until(b'e', true)?;
        let s = std::str::from_utf8(digits).expect("digits are ascii");
        let value = s.parse::<i64>().map_err(|e| Error::BadInt(e.to_string()))?;
        Ok(Bencode::Int(value))
    }

    fn byte_string(&mut self) -> Result<Bencode> {
        let digits = self.digits_until(b':', false)?;
        let s = std::str::from_utf8(digits).expect("digits are ascii");
        let len = s.parse::<usize>().map_err(|e| Error::BadInt(e.to_string()))?;
        let end = self.pos.checked_add(len).ok_or(Error::Eof)?;
        if end > self.data.len() {
            return Err(Error::Eof);
        }
        let bytes = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(Bencode::Bytes(bytes))
    }

    fn list(&mut self) -> Result<Bencode> {
        self.expect(b'l')?;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value()?);
        }
        self.pos += 1;
        Ok(Bencode::List(items))
    }

    fn dict(&mut self) -> Result<Bencode> {
        self.expect(b'd')?;
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = match self.byte_string()? {
                Bencode::Bytes(k) => k,
                _ => return Err(Error::BadDictKey(self.pos)),
            };
            let value = self.value()?;
            map.insert(key, value);
        }
        self.pos += 1;
        Ok(Bencode::Dict(map))
    }
}

impl Bencode {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Bencode::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn int(&self) -> Result<i64> {
        self.as_int().ok_or(Error::WrongType("an integer"))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Bencode::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub fn bytes(&self) -> Result<&[u8]> {
        self.as_bytes().ok_or(Error::WrongType("a byte string"))
    }

    pub fn as_list(&self) -> Option<&[Bencode]> {
        match self {
            Bencode::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn list(&self) -> Result<&[Bencode]> {
        self.as_list().ok_or(Error::WrongType("a list"))
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Bencode>> {
        match self {
            Bencode::Dict(map) => Some(map),
            _ => None,
        }
    }

    pub fn dict(&self) -> Result<&BTreeMap<Vec<u8>, Bencode>> {
        self.as_dict().ok_or(Error::WrongType("a dictionary"))
    }
}
