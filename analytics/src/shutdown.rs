//! Cooperative cancellation shared by the pipeline stages

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Why the pipeline stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Interrupted,
    SourceExhausted,
    CaptureError,
}

impl ExitReason {
    /// Process exit status: 128 + SIGINT after an interrupt, success otherwise
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Interrupted => 130,
            Self::SourceExhausted | Self::CaptureError => 0,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Interrupted => 1,
            Self::SourceExhausted => 2,
            Self::CaptureError => 3,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Interrupted),
            2 => Some(Self::SourceExhausted),
            3 => Some(Self::CaptureError),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    cause: AtomicU8,
}

/// Cloneable stop flag; stages poll it once per loop iteration
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    state: Arc<TokenState>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. The first cause recorded wins.
    pub fn cancel(&self, cause: ExitReason) {
        let _ = self.state.cause.compare_exchange(
            0,
            cause.to_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub fn cause(&self) -> Option<ExitReason> {
        ExitReason::from_u8(self.state.cause.load(Ordering::SeqCst))
    }

    /// Sleep for `duration` in short steps, returning early on cancellation.
    /// Returns true if the token was cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let step = Duration::from_millis(5);
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(step.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_cause_wins() {
        let token = ShutdownToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.cause(), None);

        let clone = token.clone();
        clone.cancel(ExitReason::SourceExhausted);
        token.cancel(ExitReason::Interrupted);

        assert!(token.is_cancelled());
        assert_eq!(token.cause(), Some(ExitReason::SourceExhausted));
        assert_eq!(ExitReason::Interrupted.exit_code(), 130);
    }

    #[test]
    fn test_sleep_returns_early_when_cancelled() {
        let token = ShutdownToken::new();
        token.cancel(ExitReason::Interrupted);
        let start = Instant::now();
        assert!(token.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));

        let idle = ShutdownToken::new();
        assert!(!idle.sleep(Duration::from_millis(10)));
    }
}
