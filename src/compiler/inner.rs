//! Verbatim capture of re-entrant tag bodies.
//!
//! When the outer handler meets a tag whose body must not be compiled (the
//! `<datasource>` body), it hands the reader to [`capture`]. The inner handler
//! keeps consuming events, tracks the nesting depth, and when the depth drops
//! back to zero returns the exact source text as a [`CapturedFragment`]. The
//! outer handler then resumes right after the closing tag.

use crate::error::{WriterError, WriterResult};
use crate::tree::CapturedFragment;
use quick_xml::events::Event;
use quick_xml::Reader;

/// Capture the body of the element whose opening tag spans `src[open_start..open_end]`.
///
/// `reader` must be positioned right after that opening tag.
pub(crate) fn capture(
    reader: &mut Reader<&[u8]>,
    src: &str,
    open_start: usize,
    open_end: usize,
) -> WriterResult<CapturedFragment> {
    let pre = slice(src, open_start, open_end)?.trim_start().to_string();
    let mut depth = 1usize;
    loop {
        let event = reader.read_event()?;
        match event {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    let close_end = reader.buffer_position();
                    let tail = slice(src, open_end, close_end)?;
                    let split = tail.rfind("</").ok_or_else(|| {
                        WriterError::ConfigSyntax("unterminated re-entrant tag".into())
                    })?;
                    return Ok(CapturedFragment {
                        pre,
                        content: tail[..split].to_string(),
                        post: tail[split..].to_string(),
                    });
                }
            }
            Event::Eof => {
                return Err(WriterError::ConfigSyntax(format!(
                    "document ended inside {pre}"
                )))
            }
            _ => {}
        }
    }
}

/// Fragment of a self-closing re-entrant tag.
pub(crate) fn empty(src: &str, open_start: usize, open_end: usize) -> WriterResult<CapturedFragment> {
    Ok(CapturedFragment {
        pre: slice(src, open_start, open_end)?.trim_start().to_string(),
        content: String::new(),
        post: String::new(),
    })
}

fn slice(src: &str, start: usize, end: usize) -> WriterResult<&str> {
    src.get(start..end)
        .ok_or_else(|| WriterError::Internal(format!("invalid capture span {start}..{end}")))
}
