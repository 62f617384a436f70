//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! The extractor reads exactly one TLS record from the client: the 5-byte
//! record header and then the number of bytes the header announces. Nothing
//! past that record is consumed, so whatever the client sends next stays in
//! the socket for the relay.
//!
//! Every byte read goes through a [`TeeReader`], which keeps a copy. The
//! proxy replays that copy to the backend verbatim instead of re-serializing
//! the handshake.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::time::timeout;
use tracing::debug;

/// Default deadline for receiving the ClientHello record.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest record length accepted (TLSCiphertext ceiling, 2^14 + 2048).
pub const MAX_RECORD_LEN: usize = (1 << 14) + 2048;

/// Length of the TLS record header.
const RECORD_HEADER_LEN: usize = 5;

/// Record content type: handshake.
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type: ClientHello.
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Extension type: server_name.
const EXT_SERVER_NAME: u16 = 0x0000;

/// Server name type: host_name.
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Errors raised while sniffing a ClientHello.
#[derive(Debug, Error)]
pub enum SniError {
    #[error("failed to read the TLS handshake: {0}")]
    Io(#[from] io::Error),

    #[error("timed out waiting for the TLS handshake")]
    Timeout,

    #[error("not a TLS handshake record (content type {0:#04x})")]
    NotHandshake(u8),

    #[error("TLS record length {0} out of bounds")]
    RecordLength(usize),

    #[error("not a TLS ClientHello (handshake type {0:#04x})")]
    NotClientHello(u8),

    #[error("truncated ClientHello: {0}")]
    Truncated(&'static str),

    #[error("malformed ClientHello extensions")]
    MalformedExtensions,

    #[error("no server_name extension in ClientHello")]
    NoServerName,

    #[error("invalid host name in server_name extension")]
    InvalidHostName,
}

/// Reader wrapper that keeps a copy of every byte it yields.
#[derive(Debug)]
pub struct TeeReader<R> {
    inner: R,
    captured: Vec<u8>,
}

impl<R> TeeReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            captured: Vec::new(),
        }
    }

    /// Bytes read so far.
    pub fn captured(&self) -> &[u8] {
        &self.captured
    }

    pub fn into_captured(self) -> Vec<u8> {
        self.captured
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let start = buf.filled().len();

        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        this.captured.extend_from_slice(&buf.filled()[start..]);
        Poll::Ready(Ok(()))
    }
}

/// Read the ClientHello from `stream` within `handshake_timeout`.
///
/// Returns the SNI host name and the exact bytes consumed from the stream.
pub async fn sniff_client_hello<R: AsyncRead + Unpin>(
    stream: &mut R,
    handshake_timeout: Duration,
) -> Result<(String, Vec<u8>), SniError> {
    let mut tee = TeeReader::new(stream);

    let sniffed = timeout(handshake_timeout, extract_sni(&mut tee)).await;
    let hostname = match sniffed {
        Ok(result) => result?,
        Err(_) => {
            debug!(bytes = tee.captured().len(), "Handshake incomplete at deadline");
            return Err(SniError::Timeout);
        }
    };

    let captured = tee.into_captured();
    debug!(hostname = %hostname, bytes = captured.len(), "SNI extracted");

    Ok((hostname, captured))
}

/// Read a single TLS handshake record and return the SNI host name.
///
/// TLS record structure:
/// - byte 0: record type (0x16 = Handshake)
/// - bytes 1-2: version
/// - bytes 3-4: record length
/// - bytes 5+: handshake message
pub async fn extract_sni<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, SniError> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    reader.read_exact(&mut header).await?;

    if header[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::NotHandshake(header[0]));
    }

    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if record_len == 0 || record_len > MAX_RECORD_LEN {
        return Err(SniError::RecordLength(record_len));
    }

    let mut record = vec![0u8; record_len];
    reader.read_exact(&mut record).await?;

    parse_client_hello(&record)
}

/// Parse the handshake message carried by a record.
///
/// Handshake ClientHello:
/// - byte 0: handshake type (0x01 = ClientHello)
/// - bytes 1-3: length
/// - bytes 4-5: client version
/// - bytes 6-37: random (32 bytes)
/// - 1 byte + variable: session ID
/// - 2 bytes + variable: cipher suites
/// - 1 byte + variable: compression methods
/// - 2 bytes + variable: extensions
fn parse_client_hello(record: &[u8]) -> Result<String, SniError> {
    let mut record = Cursor::new(record);

    let msg_type = record
        .read_u8()
        .ok_or(SniError::Truncated("handshake type"))?;
    if msg_type != HANDSHAKE_CLIENT_HELLO {
        return Err(SniError::NotClientHello(msg_type));
    }

    let hello_len = record
        .read_u24()
        .ok_or(SniError::Truncated("handshake length"))?;
    let mut hello = record
        .read_cursor(hello_len)
        .ok_or(SniError::Truncated("handshake body"))?;

    hello
        .skip(2 + 32)
        .ok_or(SniError::Truncated("version and random"))?;

    let session_id_len = hello
        .read_u8()
        .ok_or(SniError::Truncated("session id length"))?;
    hello
        .skip(session_id_len as usize)
        .ok_or(SniError::Truncated("session id"))?;

    let cipher_suites_len = hello
        .read_u16()
        .ok_or(SniError::Truncated("cipher suites length"))?;
    hello
        .skip(cipher_suites_len as usize)
        .ok_or(SniError::Truncated("cipher suites"))?;

    let compression_len = hello
        .read_u8()
        .ok_or(SniError::Truncated("compression methods length"))?;
    hello
        .skip(compression_len as usize)
        .ok_or(SniError::Truncated("compression methods"))?;

    // Extensions are optional in the ClientHello grammar.
    if hello.is_empty() {
        return Err(SniError::NoServerName);
    }

    let extensions_len = hello.read_u16().ok_or(SniError::MalformedExtensions)?;
    let mut extensions = hello
        .read_cursor(extensions_len as usize)
        .ok_or(SniError::MalformedExtensions)?;

    while !extensions.is_empty() {
        let ext_type = extensions.read_u16().ok_or(SniError::MalformedExtensions)?;
        let ext_len = extensions.read_u16().ok_or(SniError::MalformedExtensions)?;
        let ext_data = extensions
            .read_bytes(ext_len as usize)
            .ok_or(SniError::MalformedExtensions)?;

        if ext_type == EXT_SERVER_NAME {
            return parse_server_name(ext_data);
        }
    }

    Err(SniError::NoServerName)
}

/// Parse the server_name extension value.
///
/// - 2 bytes: list length
/// - for each entry:
///   - 1 byte: name type (0 = host_name)
///   - 2 bytes: name length
///   - variable: name
fn parse_server_name(data: &[u8]) -> Result<String, SniError> {
    let mut ext = Cursor::new(data);

    let list_len = ext.read_u16().ok_or(SniError::MalformedExtensions)?;
    let mut list = ext
        .read_cursor(list_len as usize)
        .ok_or(SniError::MalformedExtensions)?;

    while !list.is_empty() {
        let name_type = list.read_u8().ok_or(SniError::MalformedExtensions)?;
        let name_len = list.read_u16().ok_or(SniError::MalformedExtensions)?;
        let name = list
            .read_bytes(name_len as usize)
            .ok_or(SniError::MalformedExtensions)?;

        if name_type == NAME_TYPE_HOST_NAME {
            if name.is_empty() {
                return Err(SniError::InvalidHostName);
            }
            return std::str::from_utf8(name)
                .map(str::to_owned)
                .map_err(|_| SniError::InvalidHostName);
        }
    }

    Err(SniError::NoServerName)
}

/// Bounds-checked big-endian reader over a byte slice.
struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    fn read_cursor(&mut self, n: usize) -> Option<Cursor<'a>> {
        self.read_bytes(n).map(Cursor::new)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.read_bytes(n).map(|_| ())
    }

    fn read_u8(&mut self) -> Option<u8> {
        self.read_bytes(1).map(|b| b[0])
    }

    fn read_u16(&mut self) -> Option<u16> {
        self.read_bytes(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u24(&mut self) -> Option<usize> {
        self.read_bytes(3)
            .map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | (b[2] as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn server_name_ext(hostname: &str) -> (u16, Vec<u8>) {
        let name = hostname.as_bytes();
        let mut entry = vec![NAME_TYPE_HOST_NAME];
        entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        entry.extend_from_slice(name);

        let mut data = (entry.len() as u16).to_be_bytes().to_vec();
        data.extend_from_slice(&entry);
        (EXT_SERVER_NAME, data)
    }

    fn encode_extensions(extensions: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut raw = Vec::new();
        for (ext_type, data) in extensions {
            raw.extend_from_slice(&ext_type.to_be_bytes());
            raw.extend_from_slice(&(data.len() as u16).to_be_bytes());
            raw.extend_from_slice(data);
        }
        raw
    }

    fn client_hello_with_raw_extensions(raw_extensions: &[u8]) -> Vec<u8> {
        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0xab; 32]);
        body.push(0x00); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // TLS_AES_128_GCM_SHA256
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        body.extend_from_slice(&(raw_extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(raw_extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    fn client_hello(extensions: &[(u16, Vec<u8>)]) -> Vec<u8> {
        client_hello_with_raw_extensions(&encode_extensions(extensions))
    }

    async fn run(data: &[u8]) -> (Result<String, SniError>, Vec<u8>, usize) {
        let mut input = data;
        let mut tee = TeeReader::new(&mut input);
        let result = extract_sni(&mut tee).await;
        let captured = tee.into_captured();
        (result, captured, input.len())
    }

    #[tokio::test]
    async fn test_extract_sni_found() {
        let hello = client_hello(&[server_name_ext("example.com")]);

        let (result, captured, remaining) = run(&hello).await;

        assert_eq!(result.unwrap(), "example.com");
        assert_eq!(captured, hello);
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_extract_sni_leaves_next_record_unread() {
        let hello = client_hello(&[server_name_ext("svc.example.com")]);
        let mut data = hello.clone();
        data.extend_from_slice(&[0x17, 0x03, 0x03, 0x00, 0x02, 0xde, 0xad]);

        let (result, captured, remaining) = run(&data).await;

        assert_eq!(result.unwrap(), "svc.example.com");
        assert_eq!(captured, hello);
        assert_eq!(remaining, 7);
    }

    #[tokio::test]
    async fn test_extract_sni_after_other_extensions() {
        let hello = client_hello(&[
            (0x0015, vec![0u8; 16]), // padding
            (0x002b, vec![0x02, 0x03, 0x04]), // supported_versions
            server_name_ext("Mixed.Case.Example"),
        ]);

        let (result, _, _) = run(&hello).await;

        assert_eq!(result.unwrap(), "Mixed.Case.Example");
    }

    #[tokio::test]
    async fn test_missing_server_name() {
        let hello = client_hello(&[(0x0015, vec![0u8; 4])]);

        let (result, captured, _) = run(&hello).await;

        assert!(matches!(result, Err(SniError::NoServerName)));
        assert_eq!(captured, hello);
    }

    #[tokio::test]
    async fn test_not_handshake() {
        let (result, captured, _) = run(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").await;

        assert!(matches!(result, Err(SniError::NotHandshake(b'G'))));
        assert_eq!(captured, b"GET /");
    }

    #[tokio::test]
    async fn test_not_client_hello() {
        let mut hello = client_hello(&[server_name_ext("example.com")]);
        hello[5] = 0x02; // ServerHello

        let (result, _, _) = run(&hello).await;

        assert!(matches!(result, Err(SniError::NotClientHello(0x02))));
    }

    #[tokio::test]
    async fn test_truncated_record() {
        let hello = client_hello(&[server_name_ext("example.com")]);
        let truncated = &hello[..hello.len() / 2];

        let (result, captured, _) = run(truncated).await;

        match result {
            Err(SniError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("Expected Io error, got {:?}", other),
        }
        assert!(captured.len() <= truncated.len());
    }

    #[tokio::test]
    async fn test_oversized_record_is_not_read() {
        let mut data = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01, 0xff, 0xff];
        data.extend_from_slice(&[0u8; 64]);

        let (result, captured, remaining) = run(&data).await;

        assert!(matches!(result, Err(SniError::RecordLength(0xffff))));
        assert_eq!(captured.len(), RECORD_HEADER_LEN);
        assert_eq!(remaining, 64);
    }

    #[tokio::test]
    async fn test_extension_length_overflow() {
        let mut raw = encode_extensions(&[(0x0015, vec![0u8; 4])]);
        // Announce more extension data than the block holds.
        raw[2] = 0x01;
        raw[3] = 0x00;
        let hello = client_hello_with_raw_extensions(&raw);

        let (result, captured, _) = run(&hello).await;

        assert!(matches!(result, Err(SniError::MalformedExtensions)));
        assert_eq!(captured, hello);
    }

    #[tokio::test]
    async fn test_server_name_list_overflow() {
        let (_, mut data) = server_name_ext("example.com");
        data[1] = data[1].wrapping_add(8);
        let hello = client_hello(&[(EXT_SERVER_NAME, data)]);

        let (result, _, _) = run(&hello).await;

        assert!(matches!(result, Err(SniError::MalformedExtensions)));
    }

    #[tokio::test]
    async fn test_handshake_longer_than_record() {
        let mut hello = client_hello(&[server_name_ext("example.com")]);
        hello[6] = 0x01; // handshake length now exceeds the record

        let (result, _, _) = run(&hello).await;

        assert!(matches!(
            result,
            Err(SniError::Truncated("handshake body"))
        ));
    }

    #[tokio::test]
    async fn test_sniff_timeout() {
        let (_client, mut server) = tokio::io::duplex(64);

        let result = sniff_client_hello(&mut server, Duration::from_millis(50)).await;

        assert!(matches!(result, Err(SniError::Timeout)));
    }

    #[tokio::test]
    async fn test_tee_reader_captures_partial_reads() {
        let data = b"\x16\x03\x01\x00\x10rest";
        let mut input = &data[..];
        let mut tee = TeeReader::new(&mut input);

        let mut header = [0u8; RECORD_HEADER_LEN];
        tee.read_exact(&mut header).await.unwrap();
        assert_eq!(tee.captured(), &data[..RECORD_HEADER_LEN]);

        let mut next = [0u8; 2];
        tee.read_exact(&mut next).await.unwrap();
        assert_eq!(tee.captured(), &data[..RECORD_HEADER_LEN + 2]);
        assert_eq!(input, b"st");
    }

    #[tokio::test]
    async fn test_sniff_returns_captured_bytes() {
        let hello = client_hello(&[server_name_ext("example.org")]);
        let mut input = hello.as_slice();

        let (hostname, captured) = sniff_client_hello(&mut input, DEFAULT_HANDSHAKE_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(hostname, "example.org");
        assert_eq!(captured, hello);
    }

    proptest! {
        #[test]
        fn prop_extracts_any_host_name(
            hostname in "[a-z0-9]{1,20}(\\.[a-z0-9-]{1,20}){0,4}",
            padding in 0usize..64,
            trailing in proptest::collection::vec(any::<u8>(), 0..32),
        ) {
            let hello = client_hello(&[
                (0x0015, vec![0u8; padding]),
                server_name_ext(&hostname),
            ]);
            let mut data = hello.clone();
            data.extend_from_slice(&trailing);

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (result, captured, remaining) = rt.block_on(run(&data));

            prop_assert_eq!(result.unwrap(), hostname);
            prop_assert_eq!(captured, hello);
            prop_assert_eq!(remaining, trailing.len());
        }
    }
}
