//! Delimiter, quoting and escaping rules for the text formats we read and write.

use crate::{Error, Result};
use csv::{QuoteStyle, ReaderBuilder, Terminator, WriterBuilder};
use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quoting {
    /// Quote only fields that need it.
    Minimal,
    /// Never quote and never escape.
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    pub name: &'static str,
    pub delimiter: u8,
    pub quote: u8,
    /// Honored inside and outside quoted fields: `\x` reads as `x`.
    pub escape: Option<u8>,
    pub double_quote: bool,
    pub quoting: Quoting,
    pub terminator: u8,
}

impl Dialect {
    /// Files written by `SELECT ... INTO OUTFILE` style exports.
    pub const MYSQLDUMP: Dialect = Dialect {
        name: "mysqldump",
        delimiter: b',',
        quote: b'\'',
        escape: Some(b'\\'),
        double_quote: false,
        quoting: Quoting::Minimal,
        terminator: b'\n',
    };

    /// Tab separated rows as produced by piping query output.
    /// Values are written raw: a TAB or newline inside a value is not escaped.
    pub const MYSQLPIPE: Dialect = Dialect {
        name: "mysqlpipe",
        delimiter: b'\t',
        quote: b'\'',
        escape: None,
        double_quote: false,
        quoting: Quoting::Never,
        terminator: b'\n',
    };

    pub(crate) fn reader_builder(&self) -> ReaderBuilder {
        let mut builder = ReaderBuilder::new();
        builder
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .quote(self.quote)
            .quoting(self.quoting == Quoting::Minimal)
            .escape(self.escape)
            .double_quote(self.double_quote)
            .terminator(Terminator::Any(self.terminator));
        builder
    }

    pub(crate) fn writer_builder(&self) -> WriterBuilder {
        let mut builder = WriterBuilder::new();
        builder
            .has_headers(false)
            .delimiter(self.delimiter)
            .quote(self.quote)
            .double_quote(self.double_quote)
            .terminator(Terminator::Any(self.terminator))
            .quote_style(match self.quoting {
                Quoting::Minimal => QuoteStyle::Necessary,
                Quoting::Never => QuoteStyle::Never,
            });
        if let Some(escape) = self.escape {
            builder.escape(escape);
        }
        builder
    }

    /// The csv reader only applies escapes inside quoted fields. Unquoted
    /// fields holding the escape byte are rewritten as quoted fields (raw
    /// quote bytes get escaped) so `a\,b` reads as `a,b` and `C:\\tmp` as
    /// `C:\tmp`. Lines without the escape byte are returned as is.
    pub(crate) fn quote_escaped_fields<'a>(&self, line: &'a str) -> Result<Cow<'a, str>> {
        let escape = match self.escape {
            Some(escape) if self.quoting == Quoting::Minimal => escape,
            _ => return Ok(Cow::Borrowed(line)),
        };
        let bytes = line.as_bytes();
        if !bytes.contains(&escape) {
            return Ok(Cow::Borrowed(line));
        }

        // Delimiter, quote and escape are ASCII, so they never match inside
        // a multi-byte character and the output stays valid UTF-8.
        let mut out = Vec::with_capacity(bytes.len() + 8);
        let mut i = 0;
        loop {
            if bytes.get(i) == Some(&self.quote) {
                out.push(self.quote);
                i += 1;
                while i < bytes.len() {
                    let b = bytes[i];
                    out.push(b);
                    i += 1;
                    if b == escape {
                        if let Some(&next) = bytes.get(i) {
                            out.push(next);
                            i += 1;
                        }
                    } else if b == self.quote {
                        break;
                    }
                }
                while i < bytes.len() && bytes[i] != self.delimiter {
                    out.push(bytes[i]);
                    i += 1;
                }
            } else {
                let start = i;
                let mut escaped = false;
                while i < bytes.len() && bytes[i] != self.delimiter {
                    if bytes[i] == escape {
                        escaped = true;
                        i += 1;
                        if i == bytes.len() {
                            return Err(Error::malformed("line ends inside an escape"));
                        }
                    }
                    i += 1;
                }
                let field = &bytes[start..i];
                if escaped {
                    out.push(self.quote);
                    let mut j = 0;
                    while j < field.len() {
                        let b = field[j];
                        if b == escape {
                            out.extend_from_slice(&field[j..j + 2]);
                            j += 2;
                            continue;
                        }
                        if b == self.quote {
                            out.push(escape);
                        }
                        out.push(b);
                        j += 1;
                    }
                    out.push(self.quote);
                } else {
                    out.extend_from_slice(field);
                }
            }

            if i >= bytes.len() {
                break;
            }
            out.push(self.delimiter);
            i += 1;
        }
        String::from_utf8(out)
            .map(Cow::Owned)
            .map_err(|e| Error::malformed(e.to_string()))
    }
}
