//! Streaming removal of screen-clearing and alternate-screen sequences.
//!
//! Some agents repaint the whole screen (or swap to the alternate buffer)
//! on every update, which wipes the user's scrollback when their output is
//! replayed into a shared terminal. [`EscapeFilter`] drops exactly those
//! sequences and passes every other byte through untouched.

const ESC: u8 = 0x1b;

const ALT_SCREEN_MODES: [&[u8]; 3] = [b"?1049", b"?1047", b"?47"];

/// Stateful filter bound to one output stream.
///
/// A control sequence split across chunks is held back and completed with
/// the next chunk, so filtering a stream in pieces yields the same bytes as
/// filtering it whole.
#[derive(Debug, Default)]
pub struct EscapeFilter {
    pending: Vec<u8>,
}

impl EscapeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for the rest of a sequence.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Filter one chunk, returning the bytes safe to emit now.
    pub fn filter(&mut self, data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }

        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(data);

        let mut out = Vec::with_capacity(input.len());
        let mut i = 0;
        while i < input.len() {
            if input[i] != ESC {
                out.push(input[i]);
                i += 1;
                continue;
            }

            let Some(&next) = input.get(i + 1) else {
                self.pending.push(ESC);
                break;
            };

            match next {
                b'[' => match scan_csi(&input, i + 2) {
                    Csi::Complete(end) => {
                        let seq = &input[i..=end];
                        if !should_strip(seq) {
                            out.extend_from_slice(seq);
                        }
                        i = end + 1;
                    }
                    // Not a sequence we strip; the interrupting byte is
                    // scanned afresh.
                    Csi::Aborted(at) => {
                        out.extend_from_slice(&input[i..at]);
                        i = at;
                    }
                    Csi::Incomplete => {
                        self.pending.extend_from_slice(&input[i..]);
                        break;
                    }
                },
                // RIS: full terminal reset.
                b'c' => i += 2,
                _ => {
                    out.push(ESC);
                    i += 1;
                }
            }
        }
        out
    }

    /// Flush whatever is held back, e.g. when the stream ends.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

enum Csi {
    /// Index of the final byte (`@`..=`~`).
    Complete(usize),
    /// Index of a byte that cannot occur inside a CSI.
    Aborted(usize),
    Incomplete,
}

/// Scan CSI parameter and intermediate bytes starting at `from`.
///
/// The outcome depends only on the bytes of the sequence itself, never on
/// how much of it has arrived, so a held tail only ever grows while it is
/// still a valid prefix.
fn scan_csi(input: &[u8], from: usize) -> Csi {
    for (offset, &b) in input.get(from..).unwrap_or_default().iter().enumerate() {
        match b {
            0x40..=0x7e => return Csi::Complete(from + offset),
            0x20..=0x3f => {}
            _ => return Csi::Aborted(from + offset),
        }
    }
    Csi::Incomplete
}

fn should_strip(seq: &[u8]) -> bool {
    if seq.len() < 3 {
        return false;
    }
    let (params, final_byte) = (&seq[2..seq.len() - 1], seq[seq.len() - 1]);
    match final_byte {
        b'J' => params == b"2" || params == b"3",
        b'h' | b'l' => ALT_SCREEN_MODES.iter().any(|mode| params.starts_with(mode)),
        _ => false,
    }
}
