//! Nested transaction reference counting shared through the request context
use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;
use tracing::{error, warn};

use crate::context::BizContext;

/// Opaque transaction handle
pub type TxAny = Arc<dyn Any + Send + Sync>;

struct TxState {
    tx: Option<TxAny>,
    count: usize,
}

/// Holds one shared unit-of-work handle for a call tree.
///
/// The outermost scope to `add_ref` wins the handle; nested scopes only bump
/// the count.  The handle is dropped (never closed) when the count returns to
/// zero - committing or rolling back is the caller's job, done exactly when
/// `reach_root()` is true before the matching `unref()`.
pub struct Transactor {
    state: RwLock<TxState>,
}

impl Transactor {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TxState { tx: None, count: 0 }),
        }
    }

    /// Take a reference, storing the handle if none is held yet
    pub fn add_ref(&self, tx: TxAny) {
        let mut state = self.state.write();
        if state.tx.is_none() {
            state.tx = Some(tx);
        }
        state.count += 1;
    }

    /// Release a reference, clearing the handle on the last one
    pub fn unref(&self) {
        let mut state = self.state.write();
        state.count = state.count.saturating_sub(1);
        if state.count == 0 {
            state.tx = None;
        }
    }

    /// Currently held handle, if any
    pub fn get_tx(&self) -> Option<TxAny> {
        self.state.read().tx.clone()
    }

    /// Currently held handle downcast to a concrete type
    pub fn get_tx_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.get_tx().and_then(|tx| tx.downcast::<T>().ok())
    }

    /// True when the caller is the only remaining holder and so owns
    /// commit/rollback
    pub fn reach_root(&self) -> bool {
        // Exclusive, so the answer can't interleave with a concurrent add_ref
        self.state.write().count == 1
    }

    /// Number of outstanding references
    pub fn count(&self) -> usize {
        self.state.read().count
    }
}

impl Default for Transactor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Transactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Transactor")
            .field("held", &state.tx.is_some())
            .field("count", &state.count)
            .finish()
    }
}

/// A concrete transaction which can be finalised
pub trait TxHandle: Send + Sync + 'static {
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
}

/// One scope's participation in a (possibly shared) transaction.
///
/// Dropping it without `finalize` (an early return, say) releases the
/// reference and, at the root, rolls back.
pub struct UnitOfWork<T: TxHandle> {
    tx: Arc<T>,
    transactor: Arc<Transactor>,
    finished: bool,
}

impl<T: TxHandle> UnitOfWork<T> {

    /// Join the context's transaction, or open one with `open` if the context
    /// holds none of this type
    pub fn begin<F>(ctx: &BizContext, open: F) -> Result<Self>
    where
        F: FnOnce() -> Result<T>,
    {
        let transactor = ctx.transactor();
        let tx = match transactor.get_tx_as::<T>() {
            Some(tx) => tx,
            None => {
                if transactor.get_tx().is_some() {
                    return Err(anyhow!(
                        "context already holds a transaction of another type"));
                }
                Arc::new(open()?)
            }
        };

        transactor.add_ref(tx.clone());
        Ok(Self { tx, transactor, finished: false })
    }

    pub fn tx(&self) -> &T {
        &self.tx
    }

    /// Commit or roll back if this is the outermost scope, then release
    pub fn finalize<R, E>(mut self, outcome: &std::result::Result<R, E>)
    where
        E: std::fmt::Display,
    {
        if self.transactor.reach_root() {
            match outcome {
                Ok(_) => self.settle(T::commit),
                Err(e) => {
                    error!(error = %e, "Transaction rolled back");
                    self.settle(T::rollback);
                }
            }
        }
        self.finished = true;
    }

    fn settle(&self, action: fn(&T) -> Result<()>) {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| action(&self.tx))) {
            Ok(Err(e)) => error!("Failed to finalise transaction: {e}"),
            Err(_) => error!("Panic while finalising transaction"),
            Ok(Ok(())) => {}
        }
    }
}

impl<T: TxHandle> Drop for UnitOfWork<T> {
    fn drop(&mut self) {
        if !self.finished && self.transactor.reach_root() {
            warn!("Unit of work abandoned before finalising, rolling back");
            self.settle(T::rollback);
        }
        self.transactor.unref();
    }
}
