// src/worker/mod.rs

//! Running a task's function on a dedicated worker.
//!
//! A worker owns its own thread and single-threaded runtime. It never touches
//! the file store: inputs are shipped in with [`protocol::Message::TaskExecute`],
//! dynamic dependencies are requested from the engine, and results come back
//! as [`protocol::Message::JobDone`]. Everything crossing the link is encoded
//! as JSON text, the same framing a worker process would use on a pipe.

use tokio::sync::mpsc;

use crate::errors::{BuildError, JobError, Result};

mod child;
mod manager;
pub mod protocol;

pub(crate) use manager::{WorkerHandle, run_batch, spawn_worker};

use protocol::Message;

/// One end of the duplex text channel between the engine and a worker.
#[derive(Debug)]
pub(crate) struct WorkerLink {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl WorkerLink {
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self { tx: a_tx, rx: b_rx },
            Self { tx: b_tx, rx: a_rx },
        )
    }

    pub fn send(&self, msg: &Message) -> Result<()> {
        let text = msg.encode()?;
        self.tx
            .send(text)
            .map_err(|_| BuildError::Other(JobError::Disconnected.into()))
    }

    /// Next message, `None` once the other end is gone.
    pub async fn recv(&mut self) -> Option<Result<Message>> {
        let text = self.rx.recv().await?;
        Some(Message::decode(&text))
    }

    pub fn into_parts(self) -> (mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>) {
        (self.tx, self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn link_pair_is_crossed() {
        let (parent, mut child) = WorkerLink::pair();
        parent.send(&Message::Abort).unwrap();
        assert_eq!(child.recv().await.unwrap().unwrap(), Message::Abort);

        drop(parent);
        assert!(child.recv().await.is_none());
    }
}
