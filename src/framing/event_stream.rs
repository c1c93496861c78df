use super::{RawFrame, DONE_MARKER};

/// Splits on the blank line that ends an SSE block (`\n\n`, tolerating CRLF).
#[derive(Debug, Default)]
pub(super) struct EventStreamSplitter {
    // Everything before this offset is known to hold no boundary.
    scan_from: usize,
}

impl EventStreamSplitter {
    pub(super) fn next_block(&mut self, buf: &mut Vec<u8>) -> Option<Vec<u8>> {
        match find_boundary(buf, self.scan_from) {
            Some((end, next)) => {
                let block = buf[..end].to_vec();
                buf.drain(..next);
                self.scan_from = 0;
                Some(block)
            }
            None => {
                // A boundary can straddle chunks: rescan the last two bytes.
                self.scan_from = buf.len().saturating_sub(2);
                None
            }
        }
    }

    pub(super) fn reset(&mut self) {
        self.scan_from = 0;
    }
}

/// Returns (end of block, start of next block).
fn find_boundary(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match buf.get(i + 1) {
                Some(b'\n') => return Some((i, i + 2)),
                Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some((i, i + 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Turn one block into a frame. Blocks with no payload (comments, bare
/// `event:` lines, keep-alives) yield nothing.
pub(super) fn parse_block(block: &str) -> Option<RawFrame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            // SSE allows one optional leading space.
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if line.starts_with("id:") || line.starts_with("retry:") {
            // Ignored fields.
        } else {
            // Unprefixed payload line.
            data.push(line);
        }
    }

    if data.is_empty() {
        return None;
    }
    let payload = data.join("\n");
    if payload.trim() == DONE_MARKER {
        return Some(RawFrame::Terminal);
    }
    Some(RawFrame::Data { event, payload })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{cut_indices, cut_points, delta_text, frames_with_cuts};
    use super::super::{FrameReassembler, Framing, RawFrame};
    use proptest::prelude::*;

    const BODY: &str = "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"Hello\"}}\n\n\
                        data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\" world\"}}\n\n\
                        data: [DONE]\n\n";

    fn whole() -> Vec<RawFrame> {
        frames_with_cuts(Framing::EventStream, BODY.as_bytes(), &[])
    }

    #[test]
    fn splits_blocks_and_recognizes_done() {
        let frames = whole();
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames[0],
            RawFrame::data(r#"{"type":"content_block_delta","delta":{"text":"Hello"}}"#)
        );
        assert_eq!(frames[2], RawFrame::Terminal);
    }

    #[test]
    fn every_single_cut_point_yields_same_frames() {
        let expected = whole();
        for cut in 1..BODY.len() {
            assert_eq!(
                frames_with_cuts(Framing::EventStream, BODY.as_bytes(), &[cut]),
                expected,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn byte_at_a_time_yields_same_frames() {
        let cuts: Vec<usize> = (1..BODY.len()).collect();
        assert_eq!(frames_with_cuts(Framing::EventStream, BODY.as_bytes(), &cuts), whole());
    }

    proptest! {
        #[test]
        fn any_split_yields_the_frames_that_were_sent(
            texts in prop::collection::vec(delta_text(), 1..6),
            crlf in any::<bool>(),
            cuts in cut_indices(),
        ) {
            let eol = if crlf { "\r\n" } else { "\n" };
            let payloads: Vec<String> = texts
                .iter()
                .map(|t| serde_json::json!({ "type": "content_block_delta", "delta": { "text": t } }).to_string())
                .collect();
            let body: String = payloads
                .iter()
                .map(String::as_str)
                .chain(["[DONE]"])
                .map(|p| format!("data: {p}{eol}{eol}"))
                .collect();

            let mut expected: Vec<RawFrame> = payloads.into_iter().map(RawFrame::data).collect();
            expected.push(RawFrame::Terminal);

            let cuts = cut_points(&cuts, body.len());
            prop_assert_eq!(frames_with_cuts(Framing::EventStream, body.as_bytes(), &cuts), expected);
        }
    }

    #[test]
    fn one_chunk_with_partial_tail_holds_the_tail() {
        let mut r = FrameReassembler::new(Framing::EventStream);
        let frames = r.push(b"data: {\"a\":1}\n\ndata: {\"a\"");
        assert_eq!(frames, vec![RawFrame::data("{\"a\":1}")]);
        assert!(r.buffered() > 0);
        assert_eq!(r.push(b":2}\n"), vec![]);
        assert_eq!(r.push(b"\n"), vec![RawFrame::data("{\"a\":2}")]);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn keeps_event_name_and_ignores_comments() {
        let body = ": keep-alive\n\nevent: message_start\ndata: {\"x\":1}\n\n";
        let frames = frames_with_cuts(Framing::EventStream, body.as_bytes(), &[]);
        assert_eq!(
            frames,
            vec![RawFrame::Data {
                event: Some("message_start".into()),
                payload: "{\"x\":1}".into()
            }]
        );
    }

    #[test]
    fn tolerates_crlf_boundaries() {
        let body = "data: {\"a\":1}\r\n\r\ndata: [DONE]\r\n\r\n";
        let frames = frames_with_cuts(Framing::EventStream, body.as_bytes(), &[14, 15]);
        assert_eq!(frames, vec![RawFrame::data("{\"a\":1}"), RawFrame::Terminal]);
    }

    #[test]
    fn unprefixed_block_is_payload() {
        let frames = frames_with_cuts(Framing::EventStream, b"{\"a\":1}\n\n", &[]);
        assert_eq!(frames, vec![RawFrame::data("{\"a\":1}")]);
    }

    #[test]
    fn trailing_block_without_blank_line_is_flushed() {
        let frames = frames_with_cuts(Framing::EventStream, b"data: {\"a\":1}\n", &[]);
        assert_eq!(frames, vec![RawFrame::data("{\"a\":1}")]);
    }

    #[test]
    fn multibyte_text_split_across_chunks() {
        let body = "data: {\"t\":\"héllo ✓\"}\n\n".as_bytes();
        // Cut inside the two-byte 'é' and the three-byte check mark.
        let frames = frames_with_cuts(Framing::EventStream, body, &[14, 20]);
        assert_eq!(frames, vec![RawFrame::data("{\"t\":\"héllo ✓\"}")]);
    }
}
