//! Speculative execution: for idempotent statements, fires a
//! second attempt against a different host after a delay if the first
//! attempt hasn't returned yet, and uses whichever response arrives
//! first, dropping the other in flight (`tokio::select!`'s cancel-the-loser
//! semantics — the losing future is simply never polled again and its
//! connection-level request is left to complete or be reaped normally).

use std::time::Duration;

/// How aggressively to speculate. `None` disables speculation entirely,
/// which is also the only correct choice for non-idempotent statements
/// regardless of what policy is configured (the executor enforces this,
/// not this type).
#[derive(Debug, Clone, Copy)]
pub enum SpeculativeExecutionPolicy {
    Disabled,
    /// Fire at most `max_attempts` total (including the first), each
    /// `delay` after the previous one started, as long as none have
    /// returned yet.
    Constant { delay: Duration, max_attempts: u32 },
}

impl SpeculativeExecutionPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            SpeculativeExecutionPolicy::Disabled => None,
            SpeculativeExecutionPolicy::Constant { delay, max_attempts } => {
                if attempt < *max_attempts {
                    Some(*delay)
                } else {
                    None
                }
            }
        }
    }
}

/// Runs `attempt` against the hosts in `plan`, speculating additional
/// attempts per `policy` until one succeeds, all fail, or the plan is
/// exhausted. `attempt` is given the request's position in plan so it can
/// pick its own host.
pub async fn race<T, E, F, Fut>(
    plan_len: usize,
    policy: SpeculativeExecutionPolicy,
    idempotent: bool,
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let effective_policy = if idempotent { policy } else { SpeculativeExecutionPolicy::Disabled };

    let mut in_flight: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = (usize, Result<T, E>)> + Send>>> =
        Vec::new();
    let mut next_index = 0usize;
    let mut last_err = None;

    loop {
        if next_index < plan_len && in_flight.is_empty() {
            let fut = attempt(next_index);
            in_flight.push(Box::pin(async move { (next_index, fut.await) }));
            next_index += 1;
        }

        let delay = effective_policy.delay_for_attempt(next_index as u32);
        let sleep = match delay {
            Some(d) if next_index < plan_len => Box::pin(tokio::time::sleep(d)) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
            _ => Box::pin(std::future::pending()),
        };

        tokio::select! {
            biased;
            (index, result) = select_any(&mut in_flight) => {
                match result {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        last_err = Some(e);
                        let _ = index;
                        if in_flight.is_empty() && next_index >= plan_len {
                            return Err(last_err.unwrap());
                        }
                    }
                }
            }
            _ = sleep => {
                if next_index < plan_len {
                    let fut = attempt(next_index);
                    let idx = next_index;
                    in_flight.push(Box::pin(async move { (idx, fut.await) }));
                    next_index += 1;
                }
            }
        }
    }
}

/// Polls every future in `futs` and returns (and removes) the first one
/// that completes, or pends forever if `futs` is empty (so `select!`
/// simply waits on the other branch).
async fn select_any<T, E>(
    futs: &mut Vec<std::pin::Pin<Box<dyn std::future::Future<Output = (usize, Result<T, E>)> + Send>>>,
) -> (usize, Result<T, E>) {
    use std::future::poll_fn;
    use std::task::Poll;

    if futs.is_empty() {
        return poll_fn(|_| Poll::Pending).await;
    }
    poll_fn(|cx| {
        for i in 0..futs.len() {
            if let Poll::Ready(output) = futs[i].as_mut().poll(cx) {
                futs.remove(i);
                return Poll::Ready(output);
            }
        }
        Poll::Pending
    })
    .await
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn first_success_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result: Result<&str, &str> = race(3, SpeculativeExecutionPolicy::Disabled, true, move |_i| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("ok")
            }
        })
        .await;
        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_idempotent_disables_speculation_and_exhausts_plan_on_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result: Result<&str, &str> = race(
            2,
            SpeculativeExecutionPolicy::Constant {
                delay: Duration::from_millis(1),
                max_attempts: 3,
            },
            false,
            move |_i| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("fail")
                }
            },
        )
        .await;
        assert_eq!(result, Err("fail"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
