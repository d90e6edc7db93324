//! Splits the runtime's multiplexed log stream into stdout and stderr.
//!
//! Each frame is an 8-byte header followed by its payload:
//!
//! ```text
//! [stream: u8][0, 0, 0][len: u32 big-endian][payload: len bytes]
//! ```
//!
//! Stream 1 is stdout, stream 2 is stderr. Other stream tags are skipped.

const HEADER_LEN: usize = 8;
const STDOUT: u8 = 1;
const STDERR: u8 = 2;

/// Output separated by channel. Interleaving between channels is not kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Demuxed {
    pub stdout: String,
    pub stderr: String,
}

/// Parse `raw` frame by frame. A truncated trailing frame is dropped.
pub fn demultiplex(raw: &[u8]) -> Demuxed {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut offset = 0;

    while raw.len() - offset >= HEADER_LEN {
        let header = &raw[offset..offset + HEADER_LEN];
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let start = offset + HEADER_LEN;
        let Some(end) = start.checked_add(len).filter(|end| *end <= raw.len()) else {
            break;
        };

        let payload = &raw[start..end];
        match header[0] {
            STDOUT => stdout.extend_from_slice(payload),
            STDERR => stderr.extend_from_slice(payload),
            _ => {}
        }
        offset = end;
    }

    Demuxed {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    }
}

/// Build one frame. Used by test doubles that stand in for the runtime.
pub fn encode_frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(stream);
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
