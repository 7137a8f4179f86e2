pub type Jid = u64;
pub type Account = String;
pub type ContainerId = String;
pub type OutputBlob = bytes::Bytes;

/// A chunk of container output, tagged with the stream it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Output {
    Stdout(OutputBlob),
    Stderr(OutputBlob),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl Output {
    pub fn kind(&self) -> StreamKind {
        match self {
            Output::Stdout(_) => StreamKind::Stdout,
            Output::Stderr(_) => StreamKind::Stderr,
        }
    }

    pub fn into_blob(self) -> OutputBlob {
        match self {
            Output::Stdout(blob) | Output::Stderr(blob) => blob,
        }
    }
}
