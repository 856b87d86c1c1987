use std::io::{Read, Write};
use std::os::fd::{AsFd, OwnedFd};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::instance::OutputSink;

/// Longest title the automaton will buffer; anything longer is truncated and
/// the rest discarded up to the next BEL.
pub(crate) const TITLE_CAPACITY: usize = 256;

const READ_CHUNK: usize = 256;

const ESC: u8 = 0x1B;
const BEL: u8 = 0x07;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Normal output.
    Ground,
    /// Saw ESC.
    Escape,
    /// Saw ESC `]`.
    Osc,
    /// Saw ESC `]0`.
    TitleStart,
    /// Inside ESC `]0;`, accumulating title text.
    Title,
    /// Title overflowed; discarding until BEL or a new ESC.
    Overflow,
}

/// Byte automaton that extracts `ESC ] 0 ; <text> BEL` set-title sequences
/// from a raw terminal stream. Everything that is not part of a title
/// sequence is replayed to the passthrough buffer in original order;
/// sequence bytes themselves are never forwarded.
pub(crate) struct TitleInterceptor {
    state: State,
    title: Vec<u8>,
}

impl TitleInterceptor {
    pub(crate) fn new() -> TitleInterceptor {
        TitleInterceptor {
            state: State::Ground,
            title: Vec::with_capacity(TITLE_CAPACITY),
        }
    }

    /// True when no sequence is in flight, i.e. a chunk without ESC can be
    /// forwarded untouched.
    pub(crate) fn is_resting(&self) -> bool {
        self.state == State::Ground
    }

    pub(crate) fn feed<F: FnMut(String)>(&mut self, chunk: &[u8], out: &mut Vec<u8>, mut emit: F) {
        for &byte in chunk {
            match self.state {
                State::Ground => match byte {
                    ESC => self.state = State::Escape,
                    _ => out.push(byte),
                },
                State::Escape => match byte {
                    b']' => self.state = State::Osc,
                    _ => {
                        // Not a sequence we care about; replay it.
                        out.extend_from_slice(&[ESC, byte]);
                        self.state = State::Ground;
                    }
                },
                State::Osc => match byte {
                    b'0' => self.state = State::TitleStart,
                    _ => {
                        out.extend_from_slice(&[ESC, b']', byte]);
                        self.state = State::Ground;
                    }
                },
                State::TitleStart => match byte {
                    b';' => {
                        self.title.clear();
                        self.state = State::Title;
                    }
                    _ => {
                        out.extend_from_slice(&[ESC, b']', b'0', byte]);
                        self.state = State::Ground;
                    }
                },
                State::Title => match byte {
                    BEL => {
                        emit(String::from_utf8_lossy(&self.title).into_owned());
                        self.title.clear();
                        self.state = State::Ground;
                    }
                    // Start of a new sequence mid-title (shouldn't happen).
                    ESC => self.state = State::Escape,
                    _ => {
                        if self.title.len() < TITLE_CAPACITY {
                            self.title.push(byte);
                        } else {
                            emit(String::from_utf8_lossy(&self.title).into_owned());
                            self.title.clear();
                            self.state = State::Overflow;
                        }
                    }
                },
                State::Overflow => match byte {
                    BEL => self.state = State::Ground,
                    ESC => self.state = State::Escape,
                    _ => {}
                },
            }
        }
    }
}

/// Drain the pty master, forwarding visible output to `sink` and pushing
/// extracted titles into `titles`. Intended for `spawn_blocking`: the poll
/// timeout bounds how long a cancellation can go unnoticed.
///
/// Returns Ok on cancellation or when the slave side is fully closed.
pub(crate) fn read_loop(
    master: OwnedFd,
    sink: Option<OutputSink>,
    titles: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut file = std::fs::File::from(master);
    let mut interceptor = TitleInterceptor::new();
    let mut chunk = [0u8; READ_CHUNK];
    let mut out: Vec<u8> = Vec::with_capacity(READ_CHUNK + TITLE_CAPACITY + 4);

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        {
            let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(100u16)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(std::io::Error::from(errno)),
            }
        }

        let n = match file.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            // The master raises EIO once every slave descriptor is closed.
            Err(err) if err.raw_os_error() == Some(Errno::EIO as i32) => return Ok(()),
            Err(err) => return Err(err),
        };
        let data = &chunk[..n];

        // Fast path: no sequence in flight and no ESC in the chunk. This is
        // the common case by far.
        if interceptor.is_resting() && !data.contains(&ESC) {
            if let Some(sink) = &sink {
                let _ = sink.lock().write_all(data);
            }
            continue;
        }

        out.clear();
        interceptor.feed(data, &mut out, |title| {
            // Never block the reader on a busy consumer; the next title
            // supersedes a dropped one anyway.
            let _ = titles.try_send(title);
        });
        if let Some(sink) = &sink
            && !out.is_empty()
        {
            let _ = sink.lock().write_all(&out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::Pty;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    fn run(chunks: &[&[u8]]) -> (Vec<u8>, Vec<String>) {
        let mut interceptor = TitleInterceptor::new();
        let mut out = Vec::new();
        let mut titles = Vec::new();
        for chunk in chunks {
            interceptor.feed(chunk, &mut out, |t| titles.push(t));
        }
        (out, titles)
    }

    #[test]
    fn passthrough_is_exact_without_escapes() {
        let input = b"plain console output\r\nwith lines".as_slice();
        let (out, titles) = run(&[input]);
        assert_eq!(out, input);
        assert!(titles.is_empty());
    }

    #[test]
    fn title_is_extracted_and_not_forwarded() {
        let (out, titles) = run(&[b"before\x1b]0;foo\x07after"]);
        assert_eq!(out, b"beforeafter");
        assert_eq!(titles, ["foo"]);
    }

    #[test]
    fn title_split_across_chunks() {
        let (out, titles) = run(&[b"a\x1b]0;fo", b"o\x07b"]);
        assert_eq!(out, b"ab");
        assert_eq!(titles, ["foo"]);
    }

    #[test]
    fn malformed_sequences_are_replayed() {
        let (out, titles) = run(&[b"\x1bXv", b"\x1b]1;x", b"\x1b]0?y"]);
        assert_eq!(out, b"\x1bXv\x1b]1;x\x1b]0?y");
        assert!(titles.is_empty());
    }

    #[test]
    fn overflowing_title_is_truncated_and_stream_recovers() {
        let mut input = b"\x1b]0;".to_vec();
        input.extend(std::iter::repeat_n(b'a', TITLE_CAPACITY + 50));
        input.extend_from_slice(b"\x07ok\x1b]0;next\x07!");

        let (out, titles) = run(&[input.as_slice()]);
        assert_eq!(out, b"ok!");
        assert_eq!(titles.len(), 2);
        assert_eq!(titles[0].len(), TITLE_CAPACITY);
        assert!(titles[0].bytes().all(|b| b == b'a'));
        assert_eq!(titles[1], "next");
    }

    #[test]
    fn bel_on_exactly_full_buffer_returns_to_ground() {
        let mut input = b"\x1b]0;".to_vec();
        input.extend(std::iter::repeat_n(b'b', TITLE_CAPACITY));
        input.extend_from_slice(b"\x07visible");

        let (out, titles) = run(&[input.as_slice()]);
        assert_eq!(out, b"visible");
        assert_eq!(titles.len(), 1);
        assert_eq!(titles[0].len(), TITLE_CAPACITY);
    }

    #[test]
    fn esc_inside_title_restarts_sequence_recognition() {
        let (out, titles) = run(&[b"\x1b]0;abc\x1b]0;def\x07"]);
        assert_eq!(out, b"");
        assert_eq!(titles, ["def"]);
    }

    #[tokio::test]
    async fn read_loop_extracts_titles_from_a_real_pty() {
        let mut pty = Pty::open().unwrap();
        let master = pty.take_master().unwrap();
        let slave = pty.slave.try_clone().unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let sink: OutputSink = Arc::new(Mutex::new(Box::new(Vec::new()) as Box<dyn Write + Send>));

        let reader = tokio::task::spawn_blocking({
            let cancel = cancel.clone();
            let sink = sink.clone();
            move || read_loop(master, Some(sink), tx, cancel)
        });

        let mut writer = std::fs::File::from(slave);
        writer.write_all(b"\x1b]0;Game dedicated server\x07").unwrap();
        writer.flush().unwrap();

        let title = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("title not intercepted in time")
            .expect("title channel closed");
        assert_eq!(title, "Game dedicated server");

        cancel.cancel();
        reader.await.unwrap().unwrap();
    }
}
