//! Background generation of collision-free object identifiers.
//!
//! A single producer task draws random candidates, asks the bound store
//! whether each one is taken and pushes the free ones into a bounded queue.
//! Callers pop from the queue, so in steady state `next()` returns without
//! waiting on the backend. A full queue parks the producer.
//!
//! Verification and the caller's eventual save are not atomic: another
//! writer drawing from the same space could claim a name in between. With
//! the default 7-character base62 identifiers there are 62^7 ≈ 3.5e12
//! names, so the odds of that are negligible for any realistic store.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use ring::rand::{SecureRandom, SystemRandom};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::object_store::ImageStore;

const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const HEX: &[u8] = b"0123456789abcdef";

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
/// Lower bound on how many recently issued identifiers the producer remembers.
const MIN_RECENT: usize = 64;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("Identifier generator has shut down")]
    Closed,
}

/// Characters identifiers are drawn from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alphabet {
    /// `[0-9A-Za-z]`
    #[default]
    Base62,
    /// `[0-9a-f]`
    Hex,
}

impl Alphabet {
    pub fn chars(&self) -> &'static [u8] {
        match self {
            Alphabet::Base62 => BASE62,
            Alphabet::Hex => HEX,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GeneratorOptions {
    /// Identifier length in characters.
    pub length: usize,
    pub alphabet: Alphabet,
    /// Verified identifiers held ready ahead of demand.
    pub buffer_size: usize,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            length: 7,
            alphabet: Alphabet::Base62,
            buffer_size: 16,
        }
    }
}

/// Hands out identifiers that were absent from the bound store when checked.
pub struct IdentifierGenerator {
    receiver: Mutex<mpsc::Receiver<String>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IdentifierGenerator {
    /// Start the producer task. Must be called from within a Tokio runtime.
    pub fn spawn(store: Arc<dyn ImageStore>, options: GeneratorOptions) -> Self {
        let options = GeneratorOptions {
            length: options.length.max(1),
            buffer_size: options.buffer_size.max(1),
            ..options
        };
        let (tx, rx) = mpsc::channel(options.buffer_size);
        let cancel = CancellationToken::new();

        let producer = Producer {
            store,
            tx,
            options,
            rng: SystemRandom::new(),
            recent: Recent::new(MIN_RECENT.max(options.buffer_size * 4)),
        };
        let task = tokio::spawn(producer.run(cancel.clone()));

        tracing::debug!(
            length = options.length,
            alphabet = ?options.alphabet,
            buffer_size = options.buffer_size,
            "Identifier generator started"
        );

        Self {
            receiver: Mutex::new(rx),
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Next verified identifier, waiting only when the buffer is empty.
    ///
    /// After [`shutdown`](Self::shutdown) any identifiers still buffered are
    /// returned, then `GeneratorError::Closed`.
    pub async fn next(&self) -> Result<String, GeneratorError> {
        let mut rx = self.receiver.lock().await;
        rx.recv().await.ok_or(GeneratorError::Closed)
    }

    /// Stop the producer and wait for it to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Identifier generator task failed");
            }
        }
    }
}

impl Drop for IdentifierGenerator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Producer {
    store: Arc<dyn ImageStore>,
    tx: mpsc::Sender<String>,
    options: GeneratorOptions,
    rng: SystemRandom,
    recent: Recent,
}

impl Producer {
    async fn run(mut self, cancel: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let candidate = match random_identifier(&self.rng, &self.options) {
                Ok(candidate) => candidate,
                Err(_) => {
                    tracing::error!("System random source failed");
                    if !pause(&cancel, backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            if self.recent.contains(&candidate) {
                tokio::task::yield_now().await;
                continue;
            }

            let taken = tokio::select! {
                _ = cancel.cancelled() => break,
                taken = self.store.exists(&candidate) => taken,
            };

            match taken {
                Ok(false) => {
                    backoff = INITIAL_BACKOFF;
                    self.recent.push(candidate.clone());
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = self.tx.send(candidate) => {
                            // All receivers gone.
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                Ok(true) => {
                    tracing::debug!(candidate = %candidate, "Candidate identifier already taken");
                    tokio::task::yield_now().await;
                }
                Err(e) => {
                    tracing::warn!(
                        candidate = %candidate,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Existence check failed, discarding candidate"
                    );
                    if !pause(&cancel, backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        tracing::debug!("Identifier generator stopped");
    }
}

/// Sleep for `delay`; false if cancelled first.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Identifiers issued recently, which may not have been saved yet.
struct Recent {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl Recent {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    fn push(&mut self, id: String) {
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.members.insert(id.clone());
        self.order.push_back(id);
    }
}

/// Draw a random identifier. Bytes are rejection-sampled so every
/// character of the alphabet is equally likely.
fn random_identifier(
    rng: &dyn SecureRandom,
    options: &GeneratorOptions,
) -> Result<String, ring::error::Unspecified> {
    let chars = options.alphabet.chars();
    let n = chars.len();
    let limit = 256 - 256 % n;

    let mut out = String::with_capacity(options.length);
    let mut buf = [0u8; 32];
    while out.len() < options.length {
        rng.fill(&mut buf)?;
        for &b in &buf {
            if out.len() == options.length {
                break;
            }
            if (b as usize) < limit {
                out.push(chars[b as usize % n] as char);
            }
        }
    }
    Ok(out)
}
