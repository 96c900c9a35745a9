//! Just enough TLS parsing to recover the Server Name Indication from a ClientHello.
//!
//! Only the first flight of a TLS handshake carries the SNI in plaintext, so this parser expects
//! the payload of the first client segment. The record is allowed to be cut short (it may span
//! several segments) as long as the `server_name` extension itself is complete.

/// TLS record content type for handshake messages.
const CONTENT_TYPE_HANDSHAKE: u8 = 22;
/// Handshake message type for a ClientHello.
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 1;
/// Extension type for Server Name Indication (RFC 6066).
const EXTENSION_SERVER_NAME: u16 = 0;
/// `NameType` value for DNS host names.
const NAME_TYPE_HOST_NAME: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The payload does not start with a TLS handshake record header.
    #[error("not a TLS handshake record")]
    NotHandshake,
    /// The handshake message has the given type rather than ClientHello.
    #[error("handshake message is not a ClientHello (type {0})")]
    NotClientHello(u8),
    /// The payload ends before the server name could be read.
    #[error("truncated ClientHello")]
    Truncated,
    /// The ClientHello carries no `server_name` extension with a host name entry.
    #[error("ClientHello has no server_name extension")]
    MissingServerName,
    /// The host name is empty or not valid UTF-8.
    #[error("server name is not valid UTF-8")]
    InvalidServerName,
}

/// Bounds-checked big-endian reader over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.buf.len() < n {
            return Err(Error::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize, Error> {
        let b = self.take(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    /// Returns a sub-reader over a vector prefixed by a `len`-byte length. If the vector is cut
    /// short, the sub-reader covers whatever is left.
    fn vector_lenient(&mut self, len_bytes: usize) -> Result<Reader<'a>, Error> {
        let len = match len_bytes {
            1 => self.u8()? as usize,
            2 => self.u16()? as usize,
            _ => self.u24()?,
        };
        let n = len.min(self.buf.len());
        Ok(Reader::new(self.take(n)?))
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Parses `payload` as a TLS record carrying a ClientHello and returns the requested host name.
pub fn parse_server_name(payload: &[u8]) -> Result<String, Error> {
    let mut record = Reader::new(payload);

    if record.u8().map_err(|_| Error::NotHandshake)? != CONTENT_TYPE_HANDSHAKE {
        return Err(Error::NotHandshake);
    }
    // Legacy record version, which we don't care about beyond it being "some TLS".
    let version = record.u16()?;
    if version >> 8 != 0x03 {
        return Err(Error::NotHandshake);
    }

    let mut fragment = record.vector_lenient(2)?;
    let handshake_type = fragment.u8()?;
    if handshake_type != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(Error::NotClientHello(handshake_type));
    }

    let mut hello = fragment.vector_lenient(3)?;
    // client_version + random
    hello.take(2 + 32)?;
    // session_id
    hello.vector_lenient(1)?;
    // cipher_suites
    hello.vector_lenient(2)?;
    // compression_methods
    hello.vector_lenient(1)?;

    if hello.is_empty() {
        // No extensions at all.
        return Err(Error::MissingServerName);
    }

    let mut extensions = hello.vector_lenient(2)?;
    while !extensions.is_empty() {
        let kind = extensions.u16()?;
        let len = extensions.u16()? as usize;
        let body = extensions.take(len)?;

        if kind == EXTENSION_SERVER_NAME {
            return parse_server_name_extension(body);
        }
    }

    Err(Error::MissingServerName)
}

fn parse_server_name_extension(body: &[u8]) -> Result<String, Error> {
    let mut ext = Reader::new(body);
    let list_len = ext.u16()? as usize;
    let mut list = Reader::new(ext.take(list_len)?);

    while !list.is_empty() {
        let name_type = list.u8()?;
        let len = list.u16()? as usize;
        let name = list.take(len)?;

        if name_type == NAME_TYPE_HOST_NAME {
            return std::str::from_utf8(name)
                .map(str::to_owned)
                .map_err(|_| Error::InvalidServerName);
        }
    }

    Err(Error::MissingServerName)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::client_hello;

    /// Hand-built ClientHello with a single SNI extension.
    fn minimal_client_hello(sni: &[u8]) -> Vec<u8> {
        let mut ext = Vec::new();
        ext.extend_from_slice(&((sni.len() + 3) as u16).to_be_bytes());
        ext.push(NAME_TYPE_HOST_NAME);
        ext.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        ext.extend_from_slice(sni);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
        extensions.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&ext);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0); // session_id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_TYPE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn parses_client_hello() {
        let hello = client_hello("blocked.example");
        assert_eq!(parse_server_name(&hello).unwrap(), "blocked.example");
    }

    #[test]
    fn parses_minimal_client_hello() {
        let hello = minimal_client_hello(b"example.org");
        assert_eq!(parse_server_name(&hello).unwrap(), "example.org");
    }

    #[test]
    fn tolerates_record_longer_than_payload() {
        let mut hello = minimal_client_hello(b"example.org");
        // Pretend the record continues in a later segment.
        hello[3] = 0x40;
        assert_eq!(parse_server_name(&hello).unwrap(), "example.org");
    }

    #[test]
    fn rejects_cut_off_server_name() {
        let hello = minimal_client_hello(b"example.org");
        let cut = &hello[..hello.len() - 4];
        assert_eq!(parse_server_name(cut), Err(Error::Truncated));
    }

    #[test]
    fn rejects_non_handshake() {
        assert_eq!(parse_server_name(b"GET / HTTP/1.1\r\n\r\n"), Err(Error::NotHandshake));
        assert_eq!(parse_server_name(&[]), Err(Error::NotHandshake));
    }

    #[test]
    fn rejects_other_handshake_messages() {
        let mut hello = minimal_client_hello(b"example.org");
        hello[5] = 2; // ServerHello
        assert_eq!(parse_server_name(&hello), Err(Error::NotClientHello(2)));
    }

    #[test]
    fn missing_extension() {
        let mut hello = minimal_client_hello(b"example.org");
        // Rewrite the extension type to something else (max_fragment_length).
        let ext_start = 5 + 4 + 2 + 32 + 1 + 4 + 2 + 2;
        hello[ext_start..ext_start + 2].copy_from_slice(&1u16.to_be_bytes());
        assert_eq!(parse_server_name(&hello), Err(Error::MissingServerName));
    }
}
