use crate::trace::phase::PhaseHooks;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Default)]
struct SlotState {
    hooks: Option<Arc<dyn PhaseHooks>>,
    headers_written: bool,
    wrote_any: bool,
    request_written: bool,
    got_first_byte: bool,
}

/// Holds the hook set of the request currently on the wire.
///
/// A keep-alive connection outlives a single request, so the IO wrapper
/// cannot own one request's hooks. The slot is re-armed with the next
/// request's hook set before that request is sent, which also resets
/// the per-request milestone latches.
pub struct HookSlot {
    state: Mutex<SlotState>,
}

impl HookSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::default()),
        })
    }

    pub fn arm(&self, hooks: Arc<dyn PhaseHooks>) {
        if let Ok(mut s) = self.state.lock() {
            *s = SlotState {
                hooks: Some(hooks),
                ..SlotState::default()
            };
        }
    }

    fn note_write(&self) {
        let hooks = match self.state.lock() {
            Ok(mut s) => {
                s.wrote_any = true;
                if s.headers_written {
                    None
                } else {
                    s.headers_written = true;
                    s.hooks.clone()
                }
            }
            Err(_) => None,
        };
        if let Some(hooks) = hooks {
            hooks.on_headers_written();
        }
    }

    fn note_flush(&self) {
        let hooks = match self.state.lock() {
            Ok(mut s) => {
                if s.wrote_any && !s.request_written {
                    s.request_written = true;
                    s.hooks.clone()
                } else {
                    None
                }
            }
            Err(_) => None,
        };
        if let Some(hooks) = hooks {
            hooks.on_request_written();
        }
    }

    fn note_read(&self) {
        let hooks = match self.state.lock() {
            Ok(mut s) => {
                if s.got_first_byte {
                    None
                } else {
                    s.got_first_byte = true;
                    s.hooks.clone()
                }
            }
            Err(_) => None,
        };
        if let Some(hooks) = hooks {
            hooks.on_first_response_byte();
        }
    }
}

/// Stream wrapper that reports write/read milestones of an HTTP/1
/// exchange through the armed hook set.
///
/// On an HTTP/1 client connection the request head rides in the first
/// write, the flush after the last body write puts the whole request on
/// the wire, and the first byte read back is the start of the response.
pub struct TracedIo<S> {
    inner: S,
    slot: Arc<HookSlot>,
}

impl<S> TracedIo<S> {
    pub fn new(inner: S, slot: Arc<HookSlot>) -> Self {
        Self { inner, slot }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TracedIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    me.slot.note_read();
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TracedIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        match Pin::new(&mut me.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    me.slot.note_write();
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        match Pin::new(&mut me.inner).poll_flush(cx) {
            Poll::Ready(Ok(())) => {
                me.slot.note_flush();
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct RecordingHooks {
        events: Mutex<Vec<&'static str>>,
    }

    impl RecordingHooks {
        fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: &'static str) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl PhaseHooks for RecordingHooks {
        fn on_connection_acquire_start(&self) {}
        fn on_connection_acquired(&self, _reused: bool, _was_idle: bool) {}
        fn on_dns_start(&self, _host: &str) {}
        fn on_dns_done(&self, _coalesced: bool) {}
        fn on_connect_start(&self) {}
        fn on_connect_done(&self, _error: Option<&str>) {}
        fn on_tls_handshake_start(&self) {}
        fn on_tls_handshake_done(&self) {}
        fn on_headers_written(&self) {
            self.push("headers_written");
        }
        fn on_request_written(&self) {
            self.push("request_written");
        }
        fn on_first_response_byte(&self) {
            self.push("first_byte");
        }
    }

    #[tokio::test]
    async fn write_flush_read_fire_each_milestone_once() {
        let (client, mut server) = tokio::io::duplex(1024);
        let slot = HookSlot::new();
        let hooks = Arc::new(RecordingHooks::default());
        slot.arm(hooks.clone());
        let mut io = TracedIo::new(client, slot);

        io.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        io.flush().await.unwrap();
        io.write_all(b"ignored trailer").await.unwrap();
        io.flush().await.unwrap();

        server.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();
        let mut buf = [0u8; 8];
        io.read(&mut buf).await.unwrap();
        io.read(&mut buf).await.unwrap();

        assert_eq!(
            hooks.events(),
            vec!["headers_written", "request_written", "first_byte"]
        );
    }

    #[tokio::test]
    async fn flush_before_any_write_reports_nothing() {
        let (client, _server) = tokio::io::duplex(64);
        let slot = HookSlot::new();
        let hooks = Arc::new(RecordingHooks::default());
        slot.arm(hooks.clone());
        let mut io = TracedIo::new(client, slot);

        io.flush().await.unwrap();

        assert!(hooks.events().is_empty());
    }

    #[tokio::test]
    async fn rearming_routes_milestones_to_the_next_request() {
        let (client, mut server) = tokio::io::duplex(1024);
        let slot = HookSlot::new();
        let first = Arc::new(RecordingHooks::default());
        slot.arm(first.clone());
        let mut io = TracedIo::new(client, slot.clone());

        io.write_all(b"request one").await.unwrap();
        io.flush().await.unwrap();

        let second = Arc::new(RecordingHooks::default());
        slot.arm(second.clone());
        io.write_all(b"request two").await.unwrap();
        io.flush().await.unwrap();
        server.write_all(b"response").await.unwrap();
        let mut buf = [0u8; 8];
        io.read(&mut buf).await.unwrap();

        assert_eq!(first.events(), vec!["headers_written", "request_written"]);
        assert_eq!(
            second.events(),
            vec!["headers_written", "request_written", "first_byte"]
        );
    }
}
