//! Delimited field splitting into raw byte ranges.
//!
//! Fields are returned as ranges into the line, with surrounding quotes
//! stripped but no unescaping of the content. An empty line has zero
//! fields; a trailing delimiter yields a trailing empty field.

use granary_protocol::types::EscapeStyle;
use std::ops::Range;

pub fn split_fields(
    line: &[u8],
    delimiter: u8,
    quote: Option<u8>,
    escape: EscapeStyle,
    out: &mut Vec<Range<usize>>,
) {
    out.clear();
    if line.is_empty() {
        return;
    }
    let n = line.len();
    let mut i = 0;
    loop {
        match quote {
            Some(q) if line.get(i) == Some(&q) => {
                let content_start = i + 1;
                let mut j = content_start;
                loop {
                    if j >= n {
                        // unclosed quote: take the rest raw
                        out.push(content_start..n);
                        i = n;
                        break;
                    }
                    if line[j] == q {
                        if escape == EscapeStyle::Doubling && line.get(j + 1) == Some(&q) {
                            j += 2;
                            continue;
                        }
                        out.push(content_start..j);
                        i = j + 1;
                        break;
                    }
                    if escape == EscapeStyle::Backslash && line[j] == b'\\' && j + 1 < n {
                        j += 2;
                        continue;
                    }
                    j += 1;
                }
                // anything between the closing quote and the delimiter is dropped
                while i < n && line[i] != delimiter {
                    i += 1;
                }
            }
            _ => {
                let start = i;
                while i < n && line[i] != delimiter {
                    i += 1;
                }
                out.push(start..i);
            }
        }
        if i >= n {
            break;
        }
        // skip the delimiter; a trailing one falls through to an empty field
        i += 1;
    }
}
