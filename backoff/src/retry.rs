use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

use crate::{Condition, Operation};

/// A [Retry] is either waiting on the current attempt or sleeping before the next one.
///
/// ```text
/// Attempt --Ok--------------------------------> Ready(Ok)
///    |
///    +--Err, condition rejects----------------> Ready(Err)
///    |
///    +--Err, condition accepts--+--no delay---> Ready(Err)
///                               |
///                               +--delay------> Sleeping --elapsed--> Attempt
/// ```
#[pin_project(project = StageProj)]
enum Stage<O>
where
    O: Operation,
{
    Attempt(#[pin] O::Future),
    Sleeping(#[pin] Sleep),
}

/// Future running `operation` until it succeeds, `condition` rejects its error, or `intervals`
/// runs dry. The error of the last attempt is returned in the latter two cases.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    stage: Stage<O>,
    intervals: I,
    operation: O,
    condition: C,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<II>(intervals: II, mut operation: O, condition: C) -> Self
    where
        II: IntoIterator<IntoIter = I, Item = Duration>,
    {
        Self {
            stage: Stage::Attempt(operation.run()),
            intervals: intervals.into_iter(),
            operation,
            condition,
        }
    }

    /// Moves to [Stage::Sleeping] for the next interval, handing `error` back once there is none.
    fn back_off(mut self: Pin<&mut Self>, error: O::Error) -> Result<(), O::Error> {
        let mut this = self.as_mut().project();
        let Some(delay) = this.intervals.next() else {
            return Err(error);
        };
        this.stage
            .set(Stage::Sleeping(sleep_until(Instant::now() + delay)));
        Ok(())
    }

    fn start_attempt(self: Pin<&mut Self>) {
        let mut this = self.project();
        let attempt = this.operation.run();
        this.stage.set(Stage::Attempt(attempt));
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().project().stage.project() {
                StageProj::Attempt(attempt) => match attempt.poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(item)) => return Poll::Ready(Ok(item)),
                    Poll::Ready(Err(e)) => {
                        if !self.condition.can_retry(&e) {
                            return Poll::Ready(Err(e));
                        }
                        if let Err(e) = self.as_mut().back_off(e) {
                            return Poll::Ready(Err(e));
                        }
                    }
                },
                StageProj::Sleeping(sleep) => match sleep.poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => self.as_mut().start_attempt(),
                },
            }
        }
    }
}
