use crate::{Error, Result};
use std::{future::Future, time::Duration};
use tracing::debug;

/// Bounded exponential backoff, client-go flavoured defaults.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    /// Number of attempts before giving up
    pub steps: u32,
    /// Initial delay between attempts
    pub delay: Duration,
    /// Delay multiplier applied after each attempt
    pub factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            steps: 5,
            delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

/// Run `op` until it succeeds, retrying write conflicts (409) with `backoff`.
/// Any other error is returned immediately; exhausting the step budget
/// returns the last conflict.
pub async fn retry_on_conflict<T, F, Fut>(backoff: &Backoff, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = backoff.delay;
    let mut last = Error::Other("retry budget is zero".to_string());
    for step in 0..backoff.steps {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_conflict() => {
                debug!("write conflict, retrying (step {step}): {e}");
                last = e;
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(backoff.factor);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}
