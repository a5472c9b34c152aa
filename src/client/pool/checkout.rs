//! The future returned by [`super::Pool::checkout`].
//!
//! A checkout finishes in one of three ways: with a lease on an installed connection,
//! with the outcome of another caller's dial, or with the outcome of its own dial. A
//! checkout which owns the dial and is dropped before the dial finishes hands the dial
//! off to the runtime, so that callers waiting on it still receive a connection.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use pin_project::{pin_project, pinned_drop};
use tokio::sync::oneshot;
use tracing::{debug, trace};

#[cfg(debug_assertions)]
use self::ids::CheckoutId;
use super::record::{Lease, Record};
use super::{Config, Destination, DialId, PoolRef, PoolableConnection};
use crate::BoxFuture;
use crate::client::error::DialError;

#[cfg(debug_assertions)]
mod ids {
    use core::fmt;

    static CHECKOUT_ID: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(1);

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(super) struct CheckoutId(pub(super) usize);

    impl CheckoutId {
        pub(super) fn new() -> Self {
            CheckoutId(CHECKOUT_ID.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
        }
    }

    impl fmt::Display for CheckoutId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "checkout-{}", self.0)
        }
    }
}

type DialFuture<C> = BoxFuture<'static, Result<C, DialError>>;
type Outcome<C, R> = Result<Lease<C, R>, DialError>;

enum State<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    /// A lease was available when the checkout was created.
    Ready(Option<Lease<C, R>>),

    /// Another checkout is dialing. Wait for its outcome.
    Waiting(oneshot::Receiver<Outcome<C, R>>),

    /// This checkout owns the dial for its destination.
    Dialing { dial: DialId, connect: DialFuture<C> },

    Done,
}

impl<C, R> fmt::Debug for State<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Ready(lease) => f.debug_tuple("Ready").field(lease).finish(),
            State::Waiting(_) => f.debug_tuple("Waiting").finish(),
            State::Dialing { dial, .. } => f.debug_struct("Dialing").field("dial", dial).finish(),
            State::Done => f.debug_tuple("Done").finish(),
        }
    }
}

/// Future which resolves to a [`Lease`] on the destination's connection.
#[pin_project(PinnedDrop)]
pub struct Checkout<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    destination: Destination,
    pool: PoolRef<C, R>,
    limit: usize,
    state: State<C, R>,

    #[cfg(debug_assertions)]
    id: CheckoutId,
}

impl<C, R> fmt::Debug for Checkout<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkout")
            .field("destination", &self.destination)
            .field("state", &self.state)
            .finish()
    }
}

impl<C, R> Checkout<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    fn new(destination: Destination, pool: PoolRef<C, R>, limit: usize, state: State<C, R>) -> Self {
        #[cfg(debug_assertions)]
        let id = CheckoutId::new();

        #[cfg(debug_assertions)]
        trace!(%id, %destination, state = ?state, "creating checkout");

        Self {
            destination,
            pool,
            limit,
            state,
            #[cfg(debug_assertions)]
            id,
        }
    }

    pub(super) fn ready(destination: Destination, lease: Lease<C, R>) -> Self {
        Self::new(destination, PoolRef::none(), 0, State::Ready(Some(lease)))
    }

    pub(super) fn waiting(
        destination: Destination,
        pool: PoolRef<C, R>,
        receiver: oneshot::Receiver<Outcome<C, R>>,
        config: &Config,
    ) -> Self {
        Self::new(
            destination,
            pool,
            config.max_streams_per_connection,
            State::Waiting(receiver),
        )
    }

    pub(super) fn dialing(
        destination: Destination,
        pool: PoolRef<C, R>,
        dial: DialId,
        connect: DialFuture<C>,
        config: &Config,
    ) -> Self {
        Self::new(
            destination,
            pool,
            config.max_streams_per_connection,
            State::Dialing { dial, connect },
        )
    }

    /// The destination this checkout acquires a connection for.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }
}

/// Hand the outcome of `dial` to the pool, or keep the connection detached if the pool
/// is gone.
fn register<C, R>(
    pool: &PoolRef<C, R>,
    destination: &Destination,
    dial: DialId,
    result: Result<C, DialError>,
    limit: usize,
) -> Outcome<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    match pool.lock() {
        Some(mut inner) => inner.resolve(destination, dial, result, pool),
        None => {
            trace!(%dial, "pool dropped, connection will not be shared");
            result.map(|connection| {
                Record::new(destination.clone(), connection, limit, PoolRef::none()).lease()
            })
        }
    }
}

impl<C, R> Future for Checkout<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    type Output = Result<Lease<C, R>, DialError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let outcome = match this.state {
            State::Ready(lease) => {
                let lease = lease.take().expect("checkout polled after completion");
                *this.state = State::Done;
                return Poll::Ready(Ok(lease));
            }
            State::Waiting(receiver) => match ready!(Pin::new(receiver).poll(cx)) {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(destination = %this.destination, "pending dial abandoned");
                    Err(DialError::Abandoned {
                        destination: this.destination.clone(),
                    })
                }
            },
            State::Dialing { dial, connect } => {
                let result = ready!(connect.as_mut().poll(cx));
                register(this.pool, this.destination, *dial, result, *this.limit)
            }
            State::Done => panic!("checkout polled after completion"),
        };

        *this.state = State::Done;

        #[cfg(debug_assertions)]
        trace!(id = %this.id, ok = outcome.is_ok(), "checkout complete");

        Poll::Ready(outcome)
    }
}

#[pinned_drop]
impl<C, R> PinnedDrop for Checkout<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        let State::Dialing { dial, connect } = std::mem::replace(this.state, State::Done) else {
            return;
        };

        let pool = this.pool.clone();
        let destination = this.destination.clone();
        let limit = *this.limit;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                trace!(%dial, %destination, "checkout dropped, finishing dial in background");
                handle.spawn(async move {
                    let result = connect.await;
                    if let Err(error) = register(&pool, &destination, dial, result, limit) {
                        debug!(%dial, %error, "background dial failed");
                    }
                });
            }
            Err(_) => {
                debug!(%dial, %destination, "no runtime, abandoning dial");
                if let Some(mut inner) = pool.lock() {
                    inner.abandon(&destination, dial);
                }
            }
        }
    }
}
