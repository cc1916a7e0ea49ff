//! LLSD – the structured-data dialect used by the event queue, the
//! capability surface and parts of the federation protocol.
//!
//! Only the XML encoding is implemented; the binary and notation encodings
//! never reach the core. Maps preserve insertion order, matching what the
//! viewer-facing serializers expect.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use uuid::Uuid;

const MAX_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Value type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Llsd {
    Undef,
    Bool(bool),
    Int(i32),
    Real(f64),
    Uuid(Uuid),
    String(String),
    Binary(Vec<u8>),
    Uri(String),
    Array(Vec<Llsd>),
    /// Key/value pairs in insertion order.
    Map(Vec<(String, Llsd)>),
}

impl Llsd {
    pub fn map() -> Llsd {
        Llsd::Map(Vec::new())
    }

    pub fn array() -> Llsd {
        Llsd::Array(Vec::new())
    }

    /// Append to a map. Panics if `self` is not a map (programming error).
    pub fn insert(&mut self, key: &str, val: Llsd) -> &mut Llsd {
        match self {
            Llsd::Map(pairs) => {
                pairs.push((key.to_string(), val));
                self
            }
            _ => panic!("insert on non-map LLSD"),
        }
    }

    /// Append to an array. Panics if `self` is not an array.
    pub fn push(&mut self, val: Llsd) -> &mut Llsd {
        match self {
            Llsd::Array(items) => {
                items.push(val);
                self
            }
            _ => panic!("push on non-array LLSD"),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Llsd> {
        match self {
            Llsd::Map(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Llsd::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Llsd::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Llsd::Real(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Llsd::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Llsd::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Llsd::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Llsd]> {
        match self {
            Llsd::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Llsd::Array(items) => items.len(),
            Llsd::Map(pairs) => pairs.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Llsd {
    fn from(s: &str) -> Llsd {
        Llsd::String(s.to_string())
    }
}

impl From<i32> for Llsd {
    fn from(i: i32) -> Llsd {
        Llsd::Int(i)
    }
}

impl From<Uuid> for Llsd {
    fn from(u: Uuid) -> Llsd {
        Llsd::Uuid(u)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LlsdError {
    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("bad base64 payload")]
    Base64,
    #[error("bad UUID text")]
    BadUuid,
    #[error("bad number text: {0}")]
    BadNumber(String),
    #[error("unexpected element <{0}>")]
    UnexpectedTag(String),
    #[error("truncated document")]
    Truncated,
    #[error("nesting deeper than {MAX_DEPTH}")]
    TooDeep,
    #[error("map entry without <key>")]
    MissingKey,
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Serialise to an XML document (with the `<llsd>` root and XML header).
pub fn to_xml(llsd: &Llsd) -> String {
    let mut writer = Writer::new(Vec::new());
    let _ = writer.write_event(Event::Start(BytesStart::new("llsd")));
    write_value(&mut writer, llsd);
    let _ = writer.write_event(Event::End(BytesEnd::new("llsd")));
    let body = String::from_utf8(writer.into_inner()).unwrap_or_default();
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{}", body)
}

// Writing to a Vec cannot fail, so write errors are ignored throughout.
fn write_value(w: &mut Writer<Vec<u8>>, llsd: &Llsd) {
    match llsd {
        Llsd::Undef => {
            let _ = w.write_event(Event::Empty(BytesStart::new("undef")));
        }
        Llsd::Bool(b) => write_text(w, "boolean", if *b { "true" } else { "false" }),
        Llsd::Int(i) => write_text(w, "integer", &i.to_string()),
        Llsd::Real(r) => write_text(w, "real", &format!("{:?}", r)),
        Llsd::Uuid(u) => write_text(w, "uuid", &u.to_string()),
        Llsd::String(s) => write_text(w, "string", s),
        Llsd::Uri(s) => write_text(w, "uri", s),
        Llsd::Binary(data) => write_text(w, "binary", &BASE64.encode(data)),
        Llsd::Array(items) => {
            let _ = w.write_event(Event::Start(BytesStart::new("array")));
            for item in items {
                write_value(w, item);
            }
            let _ = w.write_event(Event::End(BytesEnd::new("array")));
        }
        Llsd::Map(pairs) => {
            let _ = w.write_event(Event::Start(BytesStart::new("map")));
            for (key, val) in pairs {
                write_text(w, "key", key);
                write_value(w, val);
            }
            let _ = w.write_event(Event::End(BytesEnd::new("map")));
        }
    }
}

fn write_text(w: &mut Writer<Vec<u8>>, tag: &str, text: &str) {
    let _ = w.write_event(Event::Start(BytesStart::new(tag)));
    let _ = w.write_event(Event::Text(BytesText::new(text)));
    let _ = w.write_event(Event::End(BytesEnd::new(tag)));
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// One pre-tokenized element of the document. Parsing over a token list
/// keeps the recursive-descent step free of reader borrow lifetimes.
#[derive(Debug)]
enum Tok {
    Start(String),
    Empty(String),
    Text(String),
    End(String),
}

/// Parse an XML document rooted at `<llsd>`.
pub fn from_xml(data: &str) -> Result<Llsd, LlsdError> {
    let mut reader = Reader::from_str(data);
    reader.config_mut().trim_text(true);

    let mut toks = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                toks.push(Tok::Start(String::from_utf8_lossy(e.name().as_ref()).into_owned()))
            }
            Event::Empty(e) => {
                toks.push(Tok::Empty(String::from_utf8_lossy(e.name().as_ref()).into_owned()))
            }
            Event::End(e) => {
                toks.push(Tok::End(String::from_utf8_lossy(e.name().as_ref()).into_owned()))
            }
            Event::Text(e) => toks.push(Tok::Text(e.unescape()?.into_owned())),
            Event::Eof => break,
            // declaration, comments, processing instructions
            _ => {}
        }
    }

    let mut pos = 0;
    expect_start(&toks, &mut pos, "llsd")?;
    let value = parse_value(&toks, &mut pos, 0)?;
    expect_end(&toks, &mut pos, "llsd")?;
    Ok(value)
}

fn expect_start(toks: &[Tok], pos: &mut usize, tag: &str) -> Result<(), LlsdError> {
    match toks.get(*pos) {
        Some(Tok::Start(name)) if name == tag => {
            *pos += 1;
            Ok(())
        }
        Some(Tok::Start(name)) | Some(Tok::Empty(name)) => {
            Err(LlsdError::UnexpectedTag(name.clone()))
        }
        _ => Err(LlsdError::Truncated),
    }
}

fn expect_end(toks: &[Tok], pos: &mut usize, tag: &str) -> Result<(), LlsdError> {
    match toks.get(*pos) {
        Some(Tok::End(name)) if name == tag => {
            *pos += 1;
            Ok(())
        }
        Some(Tok::Start(name)) | Some(Tok::Empty(name)) | Some(Tok::End(name)) => {
            Err(LlsdError::UnexpectedTag(name.clone()))
        }
        _ => Err(LlsdError::Truncated),
    }
}

/// Consume the text content of the element whose Start token was just read,
/// up to and including the matching End token. Empty content yields "".
fn take_text(toks: &[Tok], pos: &mut usize, tag: &str) -> Result<String, LlsdError> {
    let text = match toks.get(*pos) {
        Some(Tok::Text(t)) => {
            *pos += 1;
            t.clone()
        }
        _ => String::new(),
    };
    expect_end(toks, pos, tag)?;
    Ok(text)
}

fn parse_value(toks: &[Tok], pos: &mut usize, depth: usize) -> Result<Llsd, LlsdError> {
    if depth > MAX_DEPTH {
        return Err(LlsdError::TooDeep);
    }

    let tok = toks.get(*pos).ok_or(LlsdError::Truncated)?;
    match tok {
        Tok::Empty(name) => {
            let val = match name.as_str() {
                "undef" => Llsd::Undef,
                "boolean" => Llsd::Bool(false),
                "integer" => Llsd::Int(0),
                "real" => Llsd::Real(0.0),
                "uuid" => Llsd::Uuid(Uuid::nil()),
                "string" => Llsd::String(String::new()),
                "uri" => Llsd::Uri(String::new()),
                "binary" => Llsd::Binary(Vec::new()),
                "array" => Llsd::array(),
                "map" => Llsd::map(),
                other => return Err(LlsdError::UnexpectedTag(other.to_string())),
            };
            *pos += 1;
            Ok(val)
        }
        Tok::Start(name) => {
            let name = name.clone();
            *pos += 1;
            match name.as_str() {
                "undef" => {
                    expect_end(toks, pos, "undef")?;
                    Ok(Llsd::Undef)
                }
                "boolean" => {
                    let text = take_text(toks, pos, "boolean")?;
                    Ok(Llsd::Bool(text == "true" || text == "1"))
                }
                "integer" => {
                    let text = take_text(toks, pos, "integer")?;
                    if text.is_empty() {
                        Ok(Llsd::Int(0))
                    } else {
                        text.parse().map(Llsd::Int).map_err(|_| LlsdError::BadNumber(text))
                    }
                }
                "real" => {
                    let text = take_text(toks, pos, "real")?;
                    if text.is_empty() {
                        Ok(Llsd::Real(0.0))
                    } else {
                        text.parse().map(Llsd::Real).map_err(|_| LlsdError::BadNumber(text))
                    }
                }
                "uuid" => {
                    let text = take_text(toks, pos, "uuid")?;
                    if text.is_empty() {
                        Ok(Llsd::Uuid(Uuid::nil()))
                    } else {
                        Uuid::parse_str(&text).map(Llsd::Uuid).map_err(|_| LlsdError::BadUuid)
                    }
                }
                "string" => Ok(Llsd::String(take_text(toks, pos, "string")?)),
                "uri" => Ok(Llsd::Uri(take_text(toks, pos, "uri")?)),
                "binary" => {
                    let text = take_text(toks, pos, "binary")?;
                    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                    BASE64
                        .decode(cleaned.as_bytes())
                        .map(Llsd::Binary)
                        .map_err(|_| LlsdError::Base64)
                }
                "array" => {
                    let mut items = Vec::new();
                    loop {
                        match toks.get(*pos) {
                            Some(Tok::End(n)) if n == "array" => {
                                *pos += 1;
                                break;
                            }
                            Some(_) => items.push(parse_value(toks, pos, depth + 1)?),
                            None => return Err(LlsdError::Truncated),
                        }
                    }
                    Ok(Llsd::Array(items))
                }
                "map" => {
                    let mut pairs = Vec::new();
                    loop {
                        match toks.get(*pos) {
                            Some(Tok::End(n)) if n == "map" => {
                                *pos += 1;
                                break;
                            }
                            Some(Tok::Start(n)) if n == "key" => {
                                *pos += 1;
                                let key = take_text(toks, pos, "key")?;
                                let val = parse_value(toks, pos, depth + 1)?;
                                pairs.push((key, val));
                            }
                            Some(_) => return Err(LlsdError::MissingKey),
                            None => return Err(LlsdError::Truncated),
                        }
                    }
                    Ok(Llsd::Map(pairs))
                }
                other => Err(LlsdError::UnexpectedTag(other.to_string())),
            }
        }
        Tok::Text(_) | Tok::End(_) => Err(LlsdError::Truncated),
    }
}

impl fmt::Display for Llsd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Llsd::Undef => write!(f, "undef"),
            Llsd::Bool(b) => write!(f, "{}", b),
            Llsd::Int(i) => write!(f, "{}", i),
            Llsd::Real(r) => write!(f, "{}", r),
            Llsd::Uuid(u) => write!(f, "{}", u),
            Llsd::String(s) => write!(f, "{:?}", s),
            Llsd::Uri(s) => write!(f, "uri({})", s),
            Llsd::Binary(b) => write!(f, "binary[{}]", b.len()),
            Llsd::Array(items) => write!(f, "array[{}]", items.len()),
            Llsd::Map(pairs) => write!(f, "map[{}]", pairs.len()),
        }
    }
}
