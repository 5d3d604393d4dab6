//! Replay-aware futures returned by [`OrchestrationContext`].
//!
//! Both futures resolve synchronously from recorded history when possible.
//! A step with no recorded result records its action exactly once and stays
//! pending; the engine materializes the action and resumes the instance when
//! the corresponding completion event arrives.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Action, Event, OrchestrationContext};

/// Future for a single logical activity call.
pub struct ActivityFuture {
    ctx: OrchestrationContext,
    name: String,
    input: String,
    claimed_event_id: Cell<Option<u64>>,
    recorded: Cell<bool>,
}

impl ActivityFuture {
    pub(crate) fn new(ctx: OrchestrationContext, name: String, input: String) -> Self {
        Self {
            ctx,
            name,
            input,
            claimed_event_id: Cell::new(None),
            recorded: Cell::new(false),
        }
    }
}

impl Future for ActivityFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.inner.lock().unwrap();

        if this.claimed_event_id.get().is_none() {
            // Claim the next unclaimed TaskScheduled. Steps execute in order,
            // so that event must belong to this call; anything else means the
            // code no longer matches the recorded history.
            let next_schedule = inner.history.iter().find_map(|e| match e {
                Event::TaskScheduled { event_id, name, input, .. }
                    if !inner.claimed_schedules.contains(event_id) =>
                {
                    Some((*event_id, name.clone(), input.clone()))
                }
                _ => None,
            });

            match next_schedule {
                Some((event_id, name, input)) => {
                    if name != this.name {
                        inner.nondeterminism = Some(format!(
                            "schedule order mismatch: history has TaskScheduled('{name}') \
                             but code requested TaskScheduled('{}')",
                            this.name
                        ));
                        return Poll::Pending;
                    }
                    if input != this.input {
                        inner.nondeterminism = Some(format!(
                            "schedule input mismatch for '{name}': history recorded \
                             {input:?} but code supplied {:?}",
                            this.input
                        ));
                        return Poll::Pending;
                    }
                    inner.claimed_schedules.insert(event_id);
                    this.claimed_event_id.set(Some(event_id));
                }
                None => {
                    if !this.recorded.replace(true) {
                        inner.actions.push(Action::CallActivity {
                            name: this.name.clone(),
                            input: this.input.clone(),
                        });
                    }
                    return Poll::Pending;
                }
            }
        }

        let scheduled_id = match this.claimed_event_id.get() {
            Some(id) => id,
            None => return Poll::Pending,
        };
        for event in &inner.history {
            match event {
                Event::TaskCompleted { scheduled_event_id, result, .. }
                    if *scheduled_event_id == scheduled_id =>
                {
                    return Poll::Ready(Ok(result.clone()));
                }
                Event::TaskFailed { scheduled_event_id, reason, .. }
                    if *scheduled_event_id == scheduled_id =>
                {
                    return Poll::Ready(Err(reason.clone()));
                }
                _ => {}
            }
        }
        Poll::Pending
    }
}

/// Future for a named external signal wait.
pub struct ExternalEventFuture {
    ctx: OrchestrationContext,
    name: String,
    recorded: Cell<bool>,
}

impl ExternalEventFuture {
    pub(crate) fn new(ctx: OrchestrationContext, name: String) -> Self {
        Self {
            ctx,
            name,
            recorded: Cell::new(false),
        }
    }
}

impl Future for ExternalEventFuture {
    type Output = String;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.inner.lock().unwrap();

        // Signals buffered before the wait was registered are still in
        // history; the first unconsumed occurrence with our name wins.
        let matched = inner.history.iter().find_map(|e| match e {
            Event::EventRaised { event_id, name, payload, .. }
                if name == &this.name && !inner.claimed_signals.contains(event_id) =>
            {
                Some((*event_id, payload.clone()))
            }
            _ => None,
        });

        match matched {
            Some((event_id, payload)) => {
                inner.claimed_signals.insert(event_id);
                Poll::Ready(payload)
            }
            None => {
                if !this.recorded.replace(true) {
                    inner.actions.push(Action::WaitExternal {
                        name: this.name.clone(),
                    });
                }
                Poll::Pending
            }
        }
    }
}
