//! Termination-signal handling.

use anyhow::Result;
use futures::future::poll_fn;
use std::task::{Context, Poll};
use tokio::signal::unix::{Signal, SignalKind, signal};

/// A unix signal that requests an orderly shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TerminationSignal {
    Sigterm,
    Sigint,
    Sighup,
}

impl TerminationSignal {
    fn kind(self) -> SignalKind {
        match self {
            TerminationSignal::Sigterm => SignalKind::terminate(),
            TerminationSignal::Sigint => SignalKind::interrupt(),
            TerminationSignal::Sighup => SignalKind::hangup(),
        }
    }
}

/// A configured set of signals fused into one "shutdown requested" event.
pub struct Shutdown {
    signals: Vec<Signal>,
}

impl Shutdown {
    pub fn new(kinds: &[TerminationSignal]) -> Result<Self> {
        let signals = kinds
            .iter()
            .map(|kind| signal(kind.kind()))
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self { signals })
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        for signal in &mut self.signals {
            if signal.poll_recv(cx).is_ready() {
                return Poll::Ready(());
            }
        }

        Poll::Pending
    }

    /// Waits for any of the configured signals.
    pub async fn recv(&mut self) {
        poll_fn(|cx| self.poll_recv(cx)).await
    }
}
