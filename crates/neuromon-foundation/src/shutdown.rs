//! Cooperative shutdown. One shared flag, set by Ctrl-C or a 'q' keypress
//! on stdin, checked by every worker at loop heads and inside retry gaps.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cloneable view of the process-wide shutdown flag.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    requested: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    /// Sleep up to `duration`, waking early on shutdown. Returns `false`
    /// if shutdown was requested before the full duration elapsed.
    ///
    /// Sleeps in short chunks so even a 5 s scan interval reacts to
    /// shutdown within ~50 ms.
    pub fn sleep(&self, duration: Duration) -> bool {
        const CHUNK: Duration = Duration::from_millis(50);
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.is_requested() {
                return false;
            }
            let step = remaining.min(CHUNK);
            std::thread::sleep(step);
            remaining -= step;
        }
        !self.is_requested()
    }
}

/// Installs the Ctrl-C handler and the stdin key watcher, returning the
/// token everything else polls.
pub struct ShutdownHandler;

impl ShutdownHandler {
    pub fn install() -> ShutdownToken {
        let token = ShutdownToken::new();

        let ctrlc_token = token.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            tracing::info!("Shutdown requested via Ctrl-C");
            ctrlc_token.request();
        }) {
            tracing::warn!("Failed to install Ctrl-C handler: {}", e);
        }

        // The stdin watcher is detached on purpose: a blocked read on a
        // closed terminal must not delay process exit.
        let stdin_token = token.clone();
        std::thread::Builder::new()
            .name("stdin-watch".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    match line {
                        Ok(l) if l.trim().eq_ignore_ascii_case("q") => {
                            tracing::info!("Shutdown requested via keyboard");
                            stdin_token.request();
                            break;
                        }
                        Ok(_) => continue,
                        Err(_) => break,
                    }
                }
            })
            .ok();

        token
    }
}
