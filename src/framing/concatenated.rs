/// How to find the boundary between two back-to-back JSON objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectSplit {
    /// Split wherever `}` is followed by `{`, optionally across line breaks.
    ///
    /// Known limitation: a string value that itself contains `}{` is cut in
    /// two, and both halves then fail to parse and are skipped.
    #[default]
    Junction,
    /// Track brace depth outside string literals and cut where an object
    /// closes. Immune to braces inside strings.
    BraceDepth,
}

#[derive(Debug)]
pub(super) enum ObjectSplitter {
    Junction { scan_from: usize },
    BraceDepth(DepthScanner),
}

impl ObjectSplitter {
    pub(super) fn new(strategy: ObjectSplit) -> Self {
        match strategy {
            ObjectSplit::Junction => ObjectSplitter::Junction { scan_from: 0 },
            ObjectSplit::BraceDepth => ObjectSplitter::BraceDepth(DepthScanner::default()),
        }
    }

    pub(super) fn next_object(&mut self, buf: &mut Vec<u8>) -> Option<Vec<u8>> {
        match self {
            ObjectSplitter::Junction { scan_from } => match find_junction(buf, *scan_from) {
                Some((close, open)) => {
                    let object = buf[..=close].to_vec();
                    buf.drain(..open);
                    *scan_from = 0;
                    Some(object)
                }
                None => {
                    *scan_from = resume_point(buf);
                    None
                }
            },
            ObjectSplitter::BraceDepth(scanner) => scanner.next_object(buf),
        }
    }

    pub(super) fn reset(&mut self) {
        *self = match self {
            ObjectSplitter::Junction { .. } => ObjectSplitter::Junction { scan_from: 0 },
            ObjectSplitter::BraceDepth(_) => ObjectSplitter::BraceDepth(DepthScanner::default()),
        };
    }
}

/// Returns (index of the closing `}`, index of the next opening `{`).
fn find_junction(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'}' {
            let open = i + 1 + buf[i + 1..]
                .iter()
                .take_while(|b| matches!(b, b'\r' | b'\n'))
                .count();
            if buf.get(open) == Some(&b'{') {
                return Some((i, open));
            }
        }
        i += 1;
    }
    None
}

/// Where the next scan must start so a junction straddling two chunks is
/// still found: at a trailing `}` (plus line breaks), else past the end.
fn resume_point(buf: &[u8]) -> usize {
    match buf.iter().rposition(|b| !matches!(b, b'\r' | b'\n')) {
        Some(i) if buf[i] == b'}' => i,
        _ => buf.len(),
    }
}

#[derive(Debug, Default)]
pub(super) struct DepthScanner {
    pos: usize,
    depth: usize,
    start: Option<usize>,
    in_string: bool,
    escaped: bool,
}

impl DepthScanner {
    // Structural bytes are ASCII and never occur inside a multi-byte UTF-8
    // sequence, so scanning raw bytes is safe.
    fn next_object(&mut self, buf: &mut Vec<u8>) -> Option<Vec<u8>> {
        while self.pos < buf.len() {
            let b = buf[self.pos];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
            } else {
                match b {
                    b'"' if self.depth > 0 => self.in_string = true,
                    b'{' => {
                        if self.depth == 0 {
                            self.start = Some(self.pos);
                        }
                        self.depth += 1;
                    }
                    b'}' if self.depth > 0 => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            let start = self.start.take().unwrap_or(0);
                            let object = buf[start..=self.pos].to_vec();
                            buf.drain(..=self.pos);
                            self.pos = 0;
                            return Some(object);
                        }
                    }
                    _ => {}
                }
            }
            self.pos += 1;
        }
        None
    }
}
