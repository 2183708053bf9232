use log::trace;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::Key;
use crate::commands::{CommandOutcome, WriteCommand};
use crate::context::invocation_context::InvocationContext;
use crate::errors::Result;
use crate::stats::CacheStats;

/// A cross-cutting concern wrapped around every locally performed command.
///
/// Interceptors see the command as a closed enum and match on the variants
/// they care about. Returning an error from [`CommandInterceptor::before`]
/// stops the command before it touches the context; use
/// `MnemosyneError::Vetoed` for refusals.
pub trait CommandInterceptor: Send + Sync {
    fn before(&self, _ctx: &InvocationContext, _command: &WriteCommand) -> Result<()> {
        Ok(())
    }

    fn after(&self, _ctx: &InvocationContext, _command: &WriteCommand, _outcome: &CommandOutcome) {}

    /// Called for every read served to a caller.
    fn after_read(&self, _key: &Key, _hit: bool) {}
}

/// Ordered list of interceptors around [`WriteCommand::perform`].
///
/// `before` hooks run in registration order, `after` hooks in reverse.
#[derive(Default)]
pub struct InterceptorChain {
    interceptors: RwLock<Vec<Arc<dyn CommandInterceptor>>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, interceptor: Arc<dyn CommandInterceptor>) {
        self.interceptors.write().push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.read().is_empty()
    }

    /// Performs `command` against `ctx` through every interceptor.
    ///
    /// Successful commands are recorded as modifications of the context so
    /// they can be shipped to the other owners at prepare time.
    pub fn invoke(&self, ctx: &mut InvocationContext, command: WriteCommand) -> Result<CommandOutcome> {
        let interceptors = self.interceptors.read().clone();
        for interceptor in &interceptors {
            interceptor.before(ctx, &command)?;
        }
        let outcome = command.perform(ctx)?;
        trace!(
            "Performed {:?} (successful: {}) in {:?}",
            command, outcome.successful, ctx.transaction_id()
        );
        for interceptor in interceptors.iter().rev() {
            interceptor.after(ctx, &command, &outcome);
        }
        if outcome.successful {
            ctx.record_modification(command);
        }
        Ok(outcome)
    }

    pub fn notify_read(&self, key: &Key, hit: bool) {
        for interceptor in self.interceptors.read().iter() {
            interceptor.after_read(key, hit);
        }
    }
}

/// Feeds [`CacheStats`] from the commands it observes.
pub struct StatisticsInterceptor {
    stats: Arc<CacheStats>,
}

impl StatisticsInterceptor {
    pub fn new(stats: Arc<CacheStats>) -> Self {
        Self { stats }
    }
}

impl CommandInterceptor for StatisticsInterceptor {
    fn after(&self, _ctx: &InvocationContext, command: &WriteCommand, outcome: &CommandOutcome) {
        if !outcome.successful {
            return;
        }
        match command {
            WriteCommand::Put { .. } | WriteCommand::Replace { .. } => self.stats.record_stores(1),
            WriteCommand::PutAll { entries, .. } => self.stats.record_stores(entries.len() as u64),
            WriteCommand::Remove { .. } => self.stats.record_remove(),
            WriteCommand::Clear => {}
        }
    }

    fn after_read(&self, _key: &Key, hit: bool) {
        self.stats.record_read(hit);
    }
}
