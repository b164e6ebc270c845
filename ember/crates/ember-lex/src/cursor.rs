//! Character cursor for traversing source code.
//!
//! This module provides the `Cursor` struct which maintains position state
//! while iterating through source code characters. It tracks line/column
//! information for error reporting, and its entire state can be captured
//! into a [`CursorState`] and restored later - the compiler relies on this
//! to rescan the inside of an interpolated string.

/// A snapshot of a cursor's position.
///
/// Produced by [`Cursor::save`] and consumed by [`Cursor::restore`]. The
/// snapshot is a plain value; holding one does not borrow the cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CursorState {
    /// Byte position in the source.
    pub position: usize,
    /// Line number (1-based).
    pub line: u32,
    /// Column number (1-based).
    pub column: u32,
}

/// A cursor for traversing source code character by character.
///
/// The cursor maintains the current position in the source string and
/// provides methods for advancing, peeking ahead, and checking conditions.
///
/// # Example
///
/// ```
/// use ember_lex::cursor::Cursor;
///
/// let mut cursor = Cursor::new("let x");
/// assert_eq!(cursor.current_char(), 'l');
/// cursor.advance();
/// assert_eq!(cursor.current_char(), 'e');
/// ```
pub struct Cursor<'a> {
    /// The source text being traversed.
    source: &'a str,

    /// Current byte position in the source.
    position: usize,

    /// Current line number (1-based).
    line: u32,

    /// Current column number (1-based, in characters).
    column: u32,
}

impl<'a> Cursor<'a> {
    /// Creates a new cursor at the start of the given source text.
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            position: 0,
            line: 1,
            column: 1,
        }
    }

    /// The full source text this cursor traverses.
    #[inline]
    pub fn source(&self) -> &'a str {
        self.source
    }

    /// Current byte position.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Current line number (1-based).
    #[inline]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Current column number (1-based).
    #[inline]
    pub fn column(&self) -> u32 {
        self.column
    }

    /// Whether the cursor is at the end of the source.
    #[inline]
    pub fn is_at_end(&self) -> bool {
        self.position >= self.source.len()
    }

    /// Returns the current character, or `'\0'` at end of input.
    #[inline]
    pub fn current_char(&self) -> char {
        self.char_at(0)
    }

    /// Returns the character at the given byte offset from the current
    /// position, or `'\0'` past the end.
    #[inline]
    pub fn char_at(&self, offset: usize) -> char {
        let pos = self.position + offset;
        if pos >= self.source.len() {
            return '\0';
        }

        // Fast path for ASCII (most common case)
        let b = self.source.as_bytes()[pos];
        if b < 128 {
            return b as char;
        }

        // Slow path for UTF-8
        self.source[pos..].chars().next().unwrap_or('\0')
    }

    /// Advances past the current character, updating line/column tracking.
    pub fn advance(&mut self) {
        if self.is_at_end() {
            return;
        }
        let c = self.current_char();
        self.position += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
    }

    /// Advances if the current character equals `expected`.
    ///
    /// Returns `true` if the character matched and was consumed.
    pub fn match_char(&mut self, expected: char) -> bool {
        if self.current_char() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Returns the slice of source between two byte positions.
    #[inline]
    pub fn slice(&self, start: usize, end: usize) -> &'a str {
        &self.source[start..end]
    }

    /// Captures the cursor's position into a [`CursorState`].
    pub fn save(&self) -> CursorState {
        CursorState {
            position: self.position,
            line: self.line,
            column: self.column,
        }
    }

    /// Restores the cursor to a previously captured [`CursorState`].
    pub fn restore(&mut self, state: CursorState) {
        self.position = state.position;
        self.line = state.line;
        self.column = state.column;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_tracks_lines() {
        let mut cursor = Cursor::new("a\nb");
        assert_eq!(cursor.line(), 1);
        cursor.advance(); // past 'a'
        cursor.advance(); // past '\n'
        assert_eq!(cursor.line(), 2);
        assert_eq!(cursor.column(), 1);
        assert_eq!(cursor.current_char(), 'b');
    }

    #[test]
    fn test_peek_past_end_is_nul() {
        let cursor = Cursor::new("x");
        assert_eq!(cursor.char_at(1), '\0');
        assert_eq!(cursor.char_at(100), '\0');
    }

    #[test]
    fn test_match_char() {
        let mut cursor = Cursor::new("==");
        assert!(cursor.match_char('='));
        assert!(cursor.match_char('='));
        assert!(!cursor.match_char('='));
        assert!(cursor.is_at_end());
    }

    #[test]
    fn test_save_restore_round_trip() {
        let mut cursor = Cursor::new("one\ntwo");
        for _ in 0..5 {
            cursor.advance();
        }
        let state = cursor.save();
        let (pos, line, col) = (cursor.position(), cursor.line(), cursor.column());

        for _ in 0..3 {
            cursor.advance();
        }
        cursor.restore(state);

        assert_eq!(cursor.position(), pos);
        assert_eq!(cursor.line(), line);
        assert_eq!(cursor.column(), col);
    }

    #[test]
    fn test_utf8_advance() {
        let mut cursor = Cursor::new("é!");
        assert_eq!(cursor.current_char(), 'é');
        cursor.advance();
        assert_eq!(cursor.current_char(), '!');
    }
}
