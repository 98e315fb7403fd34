//! Full-duplex byte relay between two streams.
//!
//! Both directions are driven from one future which resolves only after
//! *both* have finished. A direction finishes on end-of-input (its writer is
//! then shut down so the peer sees EOF) or on an I/O error; either way the
//! other direction keeps running until its own end.
//!
//! The idle deadline belongs to the whole session: traffic in either
//! direction keeps both alive.

use std::{
    future::Future,
    io,
    pin::Pin,
    task::{self, Poll},
    time::Duration,
};

use futures::ready;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tokio_io_timeout::TimeoutReader;

const BUF_SIZE: usize = 8 * 1024;

#[derive(Debug)]
struct CopyBuffer {
    buf: Box<[u8]>,

    read_done: bool,
    pos: usize,
    cap: usize,
    amt: u64,
}

impl CopyBuffer {
    fn new() -> Self {
        Self {
            buf: vec![0; BUF_SIZE].into_boxed_slice(),

            read_done: false,
            pos: 0,
            cap: 0,
            amt: 0,
        }
    }

    fn poll_copy<R, W>(
        &mut self,
        cx: &mut task::Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<u64>>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        loop {
            if self.pos == self.cap && !self.read_done {
                let mut buf = ReadBuf::new(&mut self.buf);
                ready!(reader.as_mut().poll_read(cx, &mut buf))?;
                let n = buf.filled().len();
                if n == 0 {
                    self.read_done = true;
                } else {
                    self.pos = 0;
                    self.cap = n;
                }
            }

            while self.pos < self.cap {
                let i = ready!(writer
                    .as_mut()
                    .poll_write(cx, &self.buf[self.pos..self.cap]))?;
                if i == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write zero bytes into writer",
                    )));
                } else {
                    self.pos += i;
                    self.amt += i as u64;
                }
            }

            if self.pos == self.cap && self.read_done {
                ready!(writer.as_mut().poll_flush(cx))?;
                return Poll::Ready(Ok(self.amt));
            }
        }
    }
}

enum TransferState {
    Running(CopyBuffer),
    ShuttingDown,
    Done,
}

struct Transfer {
    state: TransferState,
    outcome: Option<io::Result<u64>>,
}

impl Transfer {
    fn new() -> Self {
        Self {
            state: TransferState::Running(CopyBuffer::new()),
            outcome: None,
        }
    }

    fn take_outcome(&mut self) -> io::Result<u64> {
        self.outcome
            .take()
            .unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::Other, "transfer not finished")))
    }
}

struct Idle {
    timeout: Option<Duration>,
    last_activity: Instant,
    expired: bool,
}

impl Idle {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            last_activity: Instant::now(),
            expired: false,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Whether a reader's timeout means the whole session went quiet.
    fn check(&mut self) -> bool {
        if let Some(timeout) = self.timeout {
            if self.last_activity.elapsed() >= timeout {
                self.expired = true;
            }
        }
        self.expired
    }
}

// `TimeoutReader` reports its deadline as a bare `TimedOut` kind.
fn is_read_deadline(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::TimedOut && e.raw_os_error().is_none()
}

/// Per-direction result of a relay. Bytes are counted as written to the
/// destination side.
#[derive(Debug)]
pub struct RelayOutcome {
    pub a_to_b: io::Result<u64>,
    pub b_to_a: io::Result<u64>,
}

pin_project! {
    #[project = RelayProj]
    struct Relay<'a, A: ?Sized, B: ?Sized> {
        #[pin]
        a: TimeoutReader<&'a mut A>,
        #[pin]
        b: TimeoutReader<&'a mut B>,

        a_to_b: Transfer,
        b_to_a: Transfer,
        idle: Idle,
        armed: bool,
    }
}

fn transfer_one_direction<A, B>(
    cx: &mut task::Context<'_>,
    transfer: &mut Transfer,
    idle: &mut Idle,
    mut r: Pin<&mut TimeoutReader<&mut A>>,
    mut w: Pin<&mut TimeoutReader<&mut B>>,
) -> Poll<()>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    loop {
        match &mut transfer.state {
            TransferState::Running(buf) => {
                if idle.expired {
                    transfer.outcome = Some(Err(io::ErrorKind::TimedOut.into()));
                    transfer.state = TransferState::ShuttingDown;
                    continue;
                }

                let before = buf.amt;
                let polled = buf.poll_copy(cx, r.as_mut(), w.as_mut());
                if buf.amt != before {
                    idle.touch();
                }
                match ready!(polled) {
                    // the other direction is still moving, keep waiting
                    Err(e) if is_read_deadline(&e) && !idle.check() => continue,
                    copied => {
                        transfer.outcome = Some(copied);
                        transfer.state = TransferState::ShuttingDown;
                    }
                }
            }
            TransferState::ShuttingDown => {
                // half-close on errors too, so the peer is not left waiting
                if let Err(e) = ready!(w.as_mut().poll_shutdown(cx)) {
                    if matches!(transfer.outcome, Some(Ok(_))) {
                        transfer.outcome = Some(Err(e));
                    }
                }
                transfer.state = TransferState::Done;
            }
            TransferState::Done => return Poll::Ready(()),
        }
    }
}

impl<A, B> Future for Relay<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    type Output = RelayOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let RelayProj {
            mut a,
            mut b,
            a_to_b,
            b_to_a,
            idle,
            armed,
        } = self.project();

        if !*armed {
            a.as_mut().set_timeout_pinned(idle.timeout);
            b.as_mut().set_timeout_pinned(idle.timeout);
            idle.touch();
            *armed = true;
        }

        let (a_done, b_done) = loop {
            let expired = idle.expired;
            let a_done =
                transfer_one_direction(cx, a_to_b, idle, a.as_mut(), b.as_mut()).is_ready();
            let b_done =
                transfer_one_direction(cx, b_to_a, idle, b.as_mut(), a.as_mut()).is_ready();
            // expiry seen late by `b_to_a` still has to end `a_to_b`
            if idle.expired == expired {
                break (a_done, b_done);
            }
        };

        if a_done && b_done {
            Poll::Ready(RelayOutcome {
                a_to_b: a_to_b.take_outcome(),
                b_to_a: b_to_a.take_outcome(),
            })
        } else {
            Poll::Pending
        }
    }
}

/// Copies `a` to `b` and `b` to `a` until both directions are finished.
///
/// With an `idle_timeout`, the relay gives up once no bytes have moved in
/// either direction for that long. Directions still running at that point end
/// with `io::ErrorKind::TimedOut`.
pub async fn relay<A, B>(a: &mut A, b: &mut B, idle_timeout: Option<Duration>) -> RelayOutcome
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    Relay {
        a: TimeoutReader::new(a),
        b: TimeoutReader::new(b),
        a_to_b: Transfer::new(),
        b_to_a: Transfer::new(),
        idle: Idle::new(idle_timeout),
        armed: false,
    }
    .await
}
