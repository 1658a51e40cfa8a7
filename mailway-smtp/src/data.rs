//! Message-data transfer helpers: receiving until the `CRLF.CRLF`
//! End-Of-Data marker (RFC 5321 section 4.5.2) and sending with
//! dot-stuffing applied.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    error::{SmtpError, SmtpResult},
    io::SmtpIo,
};

/// Reads message content from a session until a line consisting solely of
/// `.` is observed. A leading `.` on any other line is stripped. When
/// `max_size` is exceeded, reading stops where it stands and
/// [`SmtpError::TooBig`] is returned; bytes after the End-Of-Data line are
/// pushed back into the session's receive buffer.
pub struct DataReader<'a, S: AsyncRead + AsyncWrite + Unpin + Send> {
    io: &'a mut SmtpIo<S>,
    max_size: Option<usize>,
    size: usize,
    lines: Vec<Vec<u8>>,
    eod: Option<usize>,
    next: usize,
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin + Send> DataReader<'a, S> {
    pub fn new(io: &'a mut SmtpIo<S>, max_size: Option<usize>) -> Self {
        Self {
            io,
            max_size,
            size: 0,
            lines: vec![Vec::new()],
            eod: None,
            next: 0,
        }
    }

    fn append_line(&mut self, piece: &[u8]) {
        if self.lines.len() <= self.next {
            self.lines.push(piece.to_vec());
        } else {
            self.lines[self.next].extend_from_slice(piece);
        }
    }

    fn handle_finished_line(&mut self) {
        let i = self.next;
        self.next += 1;

        if self.eod.is_some() {
            return;
        }

        let line = &self.lines[i];
        let body = strip_ending(line);
        if body == b"." {
            self.eod = Some(i);
        } else if line.first() == Some(&b'.') {
            self.lines[i].remove(0);
        }
    }

    fn add_piece(&mut self, piece: &[u8]) {
        let mut last = 0;
        while let Some(nl) = piece[last..].iter().position(|&b| b == b'\n') {
            let end = last + nl + 1;
            let segment = piece[last..end].to_vec();
            self.append_line(&segment);
            self.handle_finished_line();
            last = end;
        }
        if last < piece.len() {
            let tail = piece[last..].to_vec();
            self.append_line(&tail);
        }
    }

    async fn recv_piece(&mut self) -> SmtpResult<bool> {
        if self.eod.is_some() {
            return Ok(false);
        }

        let piece = self.io.recv_raw().await?;

        self.size += piece.len();
        if let Some(max) = self.max_size {
            if self.size > max {
                self.eod = Some(self.next);
                return Err(SmtpError::TooBig);
            }
        }

        self.add_piece(&piece);
        Ok(self.eod.is_none())
    }

    /// Receive all message data from the session.
    pub async fn recv(mut self) -> SmtpResult<Vec<u8>> {
        while self.recv_piece().await? {}
        Ok(self.return_all())
    }

    fn return_all(self) -> Vec<u8> {
        let eod = self.eod.unwrap_or(self.lines.len());

        let mut data = Vec::new();
        for line in &self.lines[..eod] {
            data.extend_from_slice(line);
        }

        let mut residue = Vec::new();
        for line in self.lines.iter().skip(eod + 1) {
            residue.extend_from_slice(line);
        }
        self.io.unrecv(residue);

        data
    }
}

fn strip_ending(line: &[u8]) -> &[u8] {
    let mut line = line;
    if line.last() == Some(&b'\n') {
        line = &line[..line.len() - 1];
    }
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    line
}

/// Writes message content into a session's send buffer with dot-stuffing
/// applied: any line beginning with `.` gains a second `.`, and the
/// stream terminates with `CRLF.CRLF`.
pub struct DataSender<'a> {
    data: &'a [u8],
}

impl<'a> DataSender<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Buffer the stuffed data and terminator on the session. Nothing is
    /// flushed.
    pub fn send<S: AsyncRead + AsyncWrite + Unpin + Send>(&self, io: &mut SmtpIo<S>) {
        let data = self.data;
        let end_marker: &[u8] = if data.is_empty() || data.last() == Some(&b'\n') {
            b".\r\n"
        } else {
            b"\r\n.\r\n"
        };

        if data.first() == Some(&b'.') {
            io.buffered_send(b".");
        }

        let mut i = 0;
        while i < data.len() {
            match find_subsequence(&data[i..], b"\n.") {
                Some(offset) => {
                    let end = i + offset + 2;
                    io.buffered_send(&data[i..end]);
                    io.buffered_send(b".");
                    i = end;
                }
                None => {
                    io.buffered_send(&data[i..]);
                    i = data.len();
                }
            }
        }

        io.buffered_send(end_marker);
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::SmtpIo;
    use tokio::io::AsyncWriteExt;

    async fn reader_io(input: &[u8]) -> SmtpIo<tokio::io::DuplexStream> {
        let (client, mut server) = tokio::io::duplex(65536);
        server.write_all(input).await.unwrap();
        SmtpIo::new(client)
    }

    fn stuffed(data: &[u8]) -> Vec<u8> {
        let (client, _server) = tokio::io::duplex(64);
        let mut io = SmtpIo::new(client);
        DataSender::new(data).send(&mut io);
        io.take_send_buffer()
    }

    #[tokio::test]
    async fn reads_until_end_of_data() {
        let mut io = reader_io(b"line one\r\nline two\r\n.\r\n").await;
        let data = DataReader::new(&mut io, None).recv().await.unwrap();
        assert_eq!(data, b"line one\r\nline two\r\n");
    }

    #[tokio::test]
    async fn strips_leading_dots() {
        let mut io = reader_io(b"..stuffed\r\n.\r\n").await;
        let data = DataReader::new(&mut io, None).recv().await.unwrap();
        assert_eq!(data, b".stuffed\r\n");
    }

    #[tokio::test]
    async fn residual_bytes_are_pushed_back() {
        let mut io = reader_io(b"body\r\n.\r\nQUIT\r\n").await;
        let data = DataReader::new(&mut io, None).recv().await.unwrap();
        assert_eq!(data, b"body\r\n");
        assert_eq!(
            io.recv_command().await.unwrap(),
            (Some("QUIT".to_owned()), None)
        );
    }

    #[tokio::test]
    async fn max_size_exceeded() {
        let mut io = reader_io(b"0123456789ABCDEF\r\n.\r\n").await;
        let result = DataReader::new(&mut io, Some(8)).recv().await;
        assert!(matches!(result, Err(SmtpError::TooBig)));
    }

    #[tokio::test]
    async fn accepts_bare_lf_end_of_data() {
        let mut io = reader_io(b"body\n.\n").await;
        let data = DataReader::new(&mut io, None).recv().await.unwrap();
        assert_eq!(data, b"body\n");
    }

    #[test]
    fn sender_terminates_with_crlf_dot() {
        assert_eq!(stuffed(b"hello\r\n"), b"hello\r\n.\r\n");
        assert_eq!(stuffed(b"hello"), b"hello\r\n.\r\n");
        assert_eq!(stuffed(b""), b".\r\n");
    }

    #[test]
    fn sender_stuffs_leading_dots() {
        assert_eq!(stuffed(b".leading\r\n"), b"..leading\r\n.\r\n");
        assert_eq!(stuffed(b"a\r\n.b\r\n"), b"a\r\n..b\r\n.\r\n");
        assert_eq!(stuffed(b"a.b\r\nc.d\r\n"), b"a.b\r\nc.d\r\n.\r\n");
    }

    #[tokio::test]
    async fn dot_stuffing_round_trips() {
        for body in [
            b"simple body\r\n".as_slice(),
            b".starts with dot\r\n",
            b"multi\r\n.line\r\n..double\r\n",
            b"no trailing newline",
        ] {
            let wire = stuffed(body);
            let mut io = reader_io(&wire).await;
            let read = DataReader::new(&mut io, None).recv().await.unwrap();

            // Receiving normalizes the missing trailing newline case: the
            // sender appends CRLF before the terminator.
            let mut expected = body.to_vec();
            if body.last() != Some(&b'\n') && !body.is_empty() {
                expected.extend_from_slice(b"\r\n");
            }
            assert_eq!(read, expected);
        }
    }
}
