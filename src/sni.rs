//! Identity extraction: TLS SNI and plaintext `Host` headers.
//!
//! The ClientHello walk is purely structural. Nothing here negotiates or
//! validates TLS; a buffer that is short, malformed or lacks the SNI
//! extension simply yields no identity.

use crate::classify::TLS_HANDSHAKE;
use crate::error::GatewayError;
use crate::rules::normalize_hostname;
use tracing::debug;

const CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

/// Bounds-checked cursor over handshake bytes.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, GatewayError> {
        let value = *self.data.get(self.pos).ok_or_else(|| truncated("u8"))?;
        self.pos += 1;
        Ok(value)
    }

    fn u16(&mut self) -> Result<u16, GatewayError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Result<usize, GatewayError> {
        let bytes = self.take(3)?;
        Ok(((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], GatewayError> {
        if self.remaining() < len {
            return Err(truncated("field"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<(), GatewayError> {
        self.take(len).map(|_| ())
    }
}

fn truncated(what: &str) -> GatewayError {
    GatewayError::MalformedHandshake {
        reason: format!("truncated {}", what),
    }
}

fn malformed<S: Into<String>>(reason: S) -> GatewayError {
    GatewayError::MalformedHandshake {
        reason: reason.into(),
    }
}

/// Walk a TLS record holding a ClientHello and return its SNI hostname.
///
/// TLS record: type (1) | version (2) | length (2) | handshake
/// Handshake: type (1) | length (3) | version (2) | random (32) |
/// session id (1 + n) | cipher suites (2 + n) | compression (1 + n) |
/// extensions (2 + n)
pub fn parse_client_hello(data: &[u8]) -> Result<Option<String>, GatewayError> {
    let mut record = Reader::new(data);
    if record.u8()? != TLS_HANDSHAKE {
        return Err(malformed("not a handshake record"));
    }
    record.skip(2)?;
    let record_len = record.u16()? as usize;
    // Tolerate a record that was only partially read.
    let body = &data[record.pos..(record.pos + record_len).min(data.len())];

    let mut handshake = Reader::new(body);
    if handshake.u8()? != CLIENT_HELLO {
        return Err(malformed("handshake is not a ClientHello"));
    }
    let hello_len = handshake.u24()?;
    let hello_end = (handshake.pos + hello_len).min(body.len());
    let mut hello = Reader::new(&body[handshake.pos..hello_end]);

    hello.skip(2 + 32)?;
    let session_id_len = hello.u8()? as usize;
    hello.skip(session_id_len)?;
    let cipher_suites_len = hello.u16()? as usize;
    hello.skip(cipher_suites_len)?;
    let compression_len = hello.u8()? as usize;
    hello.skip(compression_len)?;

    if hello.remaining() < 2 {
        // Extensions are optional in a ClientHello.
        return Ok(None);
    }
    let extensions_len = (hello.u16()? as usize).min(hello.remaining());
    let extensions = hello.take(extensions_len)?;
    let mut extensions = Reader::new(extensions);

    while extensions.remaining() >= 4 {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let ext = extensions.take(ext_len)?;
        if ext_type == EXT_SERVER_NAME {
            return parse_server_name(ext);
        }
    }

    Ok(None)
}

/// server_name extension: list length (2) | { type (1) | length (2) | name }*
fn parse_server_name(ext: &[u8]) -> Result<Option<String>, GatewayError> {
    let mut reader = Reader::new(ext);
    let list_len = reader.u16()? as usize;
    let list = reader.take(list_len)?;
    let mut list = Reader::new(list);

    while list.remaining() >= 3 {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;
        if name_type == NAME_TYPE_HOST {
            let hostname = std::str::from_utf8(name).map_err(|_| malformed("server name is not UTF-8"))?;
            if hostname.is_empty() {
                return Ok(None);
            }
            return Ok(Some(normalize_hostname(hostname)));
        }
    }

    Ok(None)
}

/// SNI hostname of a ClientHello, or `None` when there is none to find.
pub fn extract_sni(data: &[u8]) -> Option<String> {
    match parse_client_hello(data) {
        Ok(sni) => sni,
        Err(e) => {
            debug!(error = %e, "No SNI identity");
            None
        }
    }
}

/// Value of the first `Host:` header, trimmed.
pub fn extract_host(data: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(data);
    text.lines()
        .skip(1)
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("host") {
                let value = value.trim();
                (!value.is_empty()).then(|| value.to_string())
            } else {
                None
            }
        })
}

/// Request-line parts of a plaintext HTTP request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

impl RequestLine {
    /// Parse the first line of `data`.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let end = data.iter().position(|&b| b == b'\n')?;
        let line = std::str::from_utf8(&data[..end]).ok()?.trim_end_matches('\r');
        let mut parts = line.split_whitespace();
        let method = parts.next()?;
        let target = parts.next()?;
        let version = parts.next()?;
        if parts.next().is_some() || !version.starts_with("HTTP/") {
            return None;
        }
        Some(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
        })
    }

    /// Byte length of the request line including its line terminator.
    pub fn encoded_len(data: &[u8]) -> Option<usize> {
        data.iter().position(|&b| b == b'\n').map(|end| end + 1)
    }

    pub fn encode(&self) -> String {
        format!("{} {} {}\r\n", self.method, self.target, self.version)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a TLS 1.2 style ClientHello record carrying `sni`.
    pub(crate) fn client_hello(sni: Option<&str>) -> Vec<u8> {
        // ec_point_formats, ignored by the walk
        let mut extensions = vec![0x00, 0x0b, 0x00, 0x02, 0x01, 0x00];
        // server_name last, so any truncation cuts into it
        if let Some(name) = sni {
            let name = name.as_bytes();
            let mut list = vec![NAME_TYPE_HOST];
            list.extend_from_slice(&(name.len() as u16).to_be_bytes());
            list.extend_from_slice(name);

            let mut ext = (list.len() as u16).to_be_bytes().to_vec();
            ext.extend_from_slice(&list);

            extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
            extensions.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext);
        }

        let mut hello = vec![0x03, 0x03];
        hello.extend_from_slice(&[0u8; 32]);
        hello.push(0); // session id
        hello.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]);
        hello.extend_from_slice(&[0x01, 0x00]);
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        let mut handshake = vec![CLIENT_HELLO];
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello);

        let mut record = vec![TLS_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_extract_sni() {
        assert_eq!(extract_sni(&client_hello(Some("Example.COM."))).as_deref(), Some("example.com"));
    }

    #[test]
    fn test_server_name_list_skips_other_name_types() {
        // type 1 entry "x", then a host_name entry
        let mut list = vec![0x01, 0x00, 0x01, b'x', NAME_TYPE_HOST, 0x00, 0x05];
        list.extend_from_slice(b"a.dev");
        let mut ext = (list.len() as u16).to_be_bytes().to_vec();
        ext.extend_from_slice(&list);
        assert_eq!(parse_server_name(&ext).unwrap().as_deref(), Some("a.dev"));

        // declared name length runs past the list
        let ext = [0x00, 0x04, NAME_TYPE_HOST, 0x00, 0x09, b'a'];
        assert!(parse_server_name(&ext).is_err());
    }

    #[test]
    fn test_missing_sni_extension() {
        assert_eq!(parse_client_hello(&client_hello(None)).unwrap(), None);
    }

    #[test]
    fn test_truncated_buffers_yield_no_identity() {
        let hello = client_hello(Some("example.com"));
        for len in 0..hello.len() {
            assert_eq!(extract_sni(&hello[..len]), None, "prefix of {} bytes", len);
        }
    }

    #[test]
    fn test_non_tls_buffer_yields_no_identity() {
        let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert!(matches!(
            parse_client_hello(request),
            Err(GatewayError::MalformedHandshake { .. })
        ));
        assert_eq!(extract_sni(request), None);
        assert_eq!(extract_sni(&[0x16, 0x03, 0x01, 0xff, 0xff, 0x02]), None);
    }

    #[test]
    fn test_extract_host() {
        let request = b"GET / HTTP/1.1\r\nUser-Agent: t\r\nhOsT:  App.example.com:8080 \r\n\r\n";
        assert_eq!(extract_host(request).as_deref(), Some("App.example.com:8080"));
        assert_eq!(extract_host(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n"), None);
        assert_eq!(extract_host(b"GET / HTTP/1.1\r\n\r\nHost: body.example\r\n"), None);
    }

    #[test]
    fn test_request_line() {
        let data = b"GET /api/x?y=1 HTTP/1.1\r\nHost: a\r\n\r\n";
        let line = RequestLine::parse(data).unwrap();
        assert_eq!(line.method, "GET");
        assert_eq!(line.target, "/api/x?y=1");
        assert_eq!(RequestLine::encoded_len(data), Some(25));
        assert_eq!(line.encode(), "GET /api/x?y=1 HTTP/1.1\r\n");

        assert!(RequestLine::parse(b"\x16\x03\x01").is_none());
        assert!(RequestLine::parse(b"garbage\r\n").is_none());
    }
}
