// ABOUTME: Incremental wire-protocol parser turning buffered bytes into complete response frames
// ABOUTME: Tolerates arbitrary fragmentation across socket reads and hands out zero-copy blobs

use crate::buffer::ByteBuffer;
use bytes::Bytes;
use std::ops::Range;

/// Maximum number of bytes a single blob's decimal length header may occupy.
const MAX_HEADER_LEN: usize = 19;

/// One complete server response: a (possibly empty) ordered sequence of
/// length-prefixed blobs terminated by an empty line.
pub type Frame = Vec<Bytes>;

/// Outcome of a single parse attempt against the connection's read buffer.
#[derive(Debug)]
pub enum ParseOutcome {
    /// A complete frame was extracted; the bytes belonging to it have
    /// already been consumed from the buffer.
    Complete(Frame),
    /// Not enough data has been buffered yet. The buffer is left
    /// unchanged; the caller should read more bytes from the socket and
    /// retry.
    Incomplete,
    /// The buffered data does not represent a valid frame. The connection
    /// must be disconnected; the buffer's contents are no longer
    /// meaningful.
    BadFormat(String),
}

/// Parses complete frames out of a [`ByteBuffer`].
///
/// A `FrameParser` is stateless beyond the buffer it wraps: each call to
/// [`try_parse`](FrameParser::try_parse) re-scans from offset zero. This
/// mirrors the two-phase `check`/`parse` split used by length-prefixed
/// binary protocols — first confirm a full frame is present without
/// allocating, then materialize it.
#[derive(Debug)]
pub struct FrameParser;

impl FrameParser {
    /// Attempt to extract one complete frame from `buffer`.
    #[tracing::instrument(skip(buffer), fields(buffered = buffer.len()))]
    pub fn try_parse(buffer: &mut ByteBuffer) -> ParseOutcome {
        match scan(buffer.as_slice()) {
            Ok(scan) => {
                let frame_bytes = buffer.split_to(scan.total_len);
                let frame = scan
                    .blob_ranges
                    .into_iter()
                    .map(|range| frame_bytes.slice(range))
                    .collect();
                ParseOutcome::Complete(frame)
            }
            Err(ScanError::Incomplete) => ParseOutcome::Incomplete,
            Err(ScanError::BadFormat(reason)) => ParseOutcome::BadFormat(reason),
        }
    }
}

struct ScanResult {
    /// Total bytes, from offset zero, that belong to this frame.
    total_len: usize,
    /// Byte ranges (within the scanned slice) of each blob's payload, in
    /// order.
    blob_ranges: Vec<Range<usize>>,
}

enum ScanError {
    Incomplete,
    BadFormat(String),
}

/// Scan `data` from offset zero for a complete frame without allocating or
/// mutating anything. Returns the total frame length and the payload
/// ranges of each blob it contains.
fn scan(data: &[u8]) -> Result<ScanResult, ScanError> {
    let mut cursor = 0usize;
    let mut blob_ranges = Vec::new();

    loop {
        let nl = match data[cursor..].iter().position(|&b| b == b'\n') {
            Some(offset) => cursor + offset,
            None => return Err(ScanError::Incomplete),
        };

        // A header line may itself be CRLF-terminated.
        let header_end = if nl > cursor && data[nl - 1] == b'\r' {
            nl - 1
        } else {
            nl
        };
        let header = &data[cursor..header_end];

        if header.is_empty() {
            // An empty line terminates the frame.
            return Ok(ScanResult {
                total_len: nl + 1,
                blob_ranges,
            });
        }

        if header.len() > MAX_HEADER_LEN {
            return Err(ScanError::BadFormat(format!(
                "length header is {} bytes, exceeds the {MAX_HEADER_LEN}-byte limit",
                header.len()
            )));
        }
        if !header.iter().all(u8::is_ascii_digit) {
            return Err(ScanError::BadFormat(
                "blob length header is not a decimal integer".to_string(),
            ));
        }
        let size: usize = std::str::from_utf8(header)
            .expect("validated as ASCII digits above")
            .parse()
            .map_err(|_| ScanError::BadFormat("blob length header overflows usize".to_string()))?;

        let payload_start = nl + 1;
        let payload_end = payload_start + size;
        if data.len() < payload_end {
            return Err(ScanError::Incomplete);
        }

        // A terminator (`\n` or `\r\n`) must follow the payload.
        match data.get(payload_end) {
            Some(b'\n') => cursor = payload_end + 1,
            Some(b'\r') => match data.get(payload_end + 1) {
                Some(b'\n') => cursor = payload_end + 2,
                Some(_) => {
                    return Err(ScanError::BadFormat(
                        "blob payload followed by bare '\\r' with no '\\n'".to_string(),
                    ));
                }
                None => return Err(ScanError::Incomplete),
            },
            _ => return Err(ScanError::Incomplete),
        }

        blob_ranges.push(payload_start..payload_end);
    }
}
