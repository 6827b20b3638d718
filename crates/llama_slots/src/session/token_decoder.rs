use tracing::trace;

/// Accumulates token byte pieces and releases only complete, valid UTF-8.
///
/// A multi-byte codepoint may be split across several tokens; its leading bytes stay buffered
/// until the rest arrives. Bytes that can never become valid UTF-8 are dropped rather than
/// being replaced with `U+FFFD`.
#[derive(Debug, Default)]
pub struct TokenDecoder {
    buf: Vec<u8>,
}

impl TokenDecoder {
    /// Creates an empty decoder.
    pub fn new() -> TokenDecoder {
        TokenDecoder { buf: Vec::new() }
    }

    /// Appends `piece` and returns every character that became decodable, possibly none.
    pub fn add_token(&mut self, piece: &[u8]) -> String {
        self.buf.extend_from_slice(piece);

        let mut out = String::new();
        let mut token = self.buf.as_slice();

        loop {
            match std::str::from_utf8(token) {
                Ok(s) => {
                    out.push_str(s);
                    token = &[];
                    break;
                }
                Err(err) => {
                    let (valid, rest) = token.split_at(err.valid_up_to());
                    if let Ok(s) = std::str::from_utf8(valid) {
                        out.push_str(s);
                    }

                    if let Some(len) = err.error_len() {
                        trace!("Dropping {len} invalid UTF-8 byte(s)");
                        token = &rest[len..];
                    } else {
                        // An incomplete codepoint at the end; keep it for the next piece.
                        token = rest;
                        break;
                    }
                }
            }
        }

        let pending = token.len();
        let consumed = self.buf.len() - pending;
        self.buf.drain(..consumed);

        out
    }

    /// Returns the number of buffered bytes awaiting completion.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Forgets any buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
