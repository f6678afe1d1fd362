//! Client input: lines typed by the user, one chat message each

use tokio::io::{self, AsyncBufReadExt, AsyncRead, BufReader, Lines, Stdin};

/// Line source feeding outgoing chat messages
pub struct LineInput<R> {
    lines: Lines<BufReader<R>>,
}

impl LineInput<Stdin> {
    pub fn stdin() -> Self {
        Self::new(io::stdin())
    }
}

impl<R: AsyncRead + Unpin> LineInput<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Returns the next line without its terminator, or `None` at end of input
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let line = self.lines.next_line().await?;
        Ok(line.map(|mut line| {
            let len = line.trim_end_matches(['\r', '\n']).len();
            line.truncate(len);
            line
        }))
    }
}
