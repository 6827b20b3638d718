//! Output filters deciding how generated text is grouped into units.

use std::mem;

/// Groups generated text fragments into the units handed to the consumer.
///
/// Filters never drop or duplicate text: the concatenation of everything returned by
/// [`TokenFilter::process`] and the final [`TokenFilter::flush`] equals the concatenation of
/// the input fragments.
pub trait TokenFilter: Send {
    /// Feeds one fragment and returns the units that became complete.
    fn process(&mut self, token: &str) -> Vec<String>;

    /// Returns whatever is still buffered.
    fn flush(&mut self) -> Vec<String>;
}

/// Emits every fragment as-is.
#[derive(Clone, Debug, Default)]
pub struct PassthroughFilter;

impl TokenFilter for PassthroughFilter {
    fn process(&mut self, token: &str) -> Vec<String> {
        if token.is_empty() {
            Vec::new()
        } else {
            vec![token.to_string()]
        }
    }

    fn flush(&mut self) -> Vec<String> {
        Vec::new()
    }
}

/// Buffers text until a sentence ends.
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace, or at one of those at the end
/// of the buffer. A `.` right after a digit at the end of the buffer is held back, since it
/// may be a decimal point. Sentences shorter than `min_length` characters are merged with
/// the next one.
#[derive(Clone, Debug)]
pub struct SentenceFilter {
    min_length: usize,
    buffer: String,
}

impl SentenceFilter {
    /// Creates a filter that emits units of at least `min_length` characters.
    pub fn new(min_length: usize) -> Self {
        Self {
            min_length,
            buffer: String::new(),
        }
    }

    /// Returns the byte offset just past every sentence end in the buffer.
    fn boundaries(&self) -> Vec<usize> {
        let mut boundaries = Vec::new();
        let mut chars = self.buffer.char_indices().peekable();
        let mut previous = None;

        while let Some((i, c)) = chars.next() {
            if matches!(c, '.' | '!' | '?') {
                let end = i + c.len_utf8();
                let ends_here = match chars.peek() {
                    Some(&(_, next)) => next.is_whitespace(),
                    None => !(c == '.' && previous.is_some_and(|p: char| p.is_ascii_digit())),
                };

                if ends_here {
                    boundaries.push(end);
                }
            }

            previous = Some(c);
        }

        boundaries
    }
}

impl TokenFilter for SentenceFilter {
    fn process(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);

        let mut units = Vec::new();
        let mut start = 0;

        for end in self.boundaries() {
            if self.buffer[start..end].chars().count() >= self.min_length {
                units.push(self.buffer[start..end].to_string());
                start = end;
            }
        }

        self.buffer.drain(..start);
        units
    }

    fn flush(&mut self) -> Vec<String> {
        if self.buffer.is_empty() {
            Vec::new()
        } else {
            vec![mem::take(&mut self.buffer)]
        }
    }
}

/// Holds back everything until the response is complete.
#[derive(Clone, Debug, Default)]
pub struct FullResponseFilter {
    buffer: String,
}

impl FullResponseFilter {
    /// Creates an empty filter.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenFilter for FullResponseFilter {
    fn process(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);
        Vec::new()
    }

    fn flush(&mut self) -> Vec<String> {
        if self.buffer.is_empty() {
            Vec::new()
        } else {
            vec![mem::take(&mut self.buffer)]
        }
    }
}
