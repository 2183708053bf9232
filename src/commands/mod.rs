//! Write commands and the interceptor chain they are performed through.
//!
//! Every mutation of the cache is expressed as a [`WriteCommand`]. A command is
//! plain data: it serializes to exactly the fields needed to replay it on
//! another member, and [`WriteCommand::perform`] applies it to the entries
//! wrapped in an [`InvocationContext`].

use serde::{Deserialize, Serialize};

use crate::context::invocation_context::InvocationContext;
use crate::data_store::versioned_value::{EntryVersion, Metadata, VersionedValue};
use crate::distributed::consistent_hash::CacheTopology;
use crate::errors::Result;
use crate::{Key, Value};

pub mod interceptor;
pub mod remote;

/// What a performed command hands back to its caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandReturn {
    None,
    /// Previous (or, for an unsuccessful put-if-absent, existing) value.
    Value(Option<Value>),
    /// Outcome of a conditional remove or replace.
    Bool(bool),
    /// Committed entry returned by a clustered read.
    Entry(Option<VersionedValue>),
    /// Versions assigned by a primary owner during prepare.
    Versions(Vec<(Key, EntryVersion)>),
    /// Routing table handed to a joining member.
    Topology(CacheTopology),
}

impl CommandReturn {
    pub fn into_value(self) -> Option<Value> {
        match self {
            CommandReturn::Value(value) => value,
            CommandReturn::Entry(entry) => entry.map(|e| e.data().clone()),
            _ => None,
        }
    }

    pub fn into_bool(self) -> bool {
        matches!(self, CommandReturn::Bool(true))
    }
}

/// Result of [`WriteCommand::perform`].
///
/// `successful` reports the business outcome (condition met, key present) and
/// is independent of infrastructure failures, which surface as `Err`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub successful: bool,
    pub value: CommandReturn,
}

impl CommandOutcome {
    fn success(value: CommandReturn) -> Self {
        Self {
            successful: true,
            value,
        }
    }

    fn failure(value: CommandReturn) -> Self {
        Self {
            successful: false,
            value,
        }
    }
}

/// The closed set of write operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteCommand {
    Put {
        key: Key,
        value: Value,
        metadata: Metadata,
        put_if_absent: bool,
        /// Skip returning the previous value. The write is then blind and
        /// exempt from write-skew checks.
        ignore_return: bool,
    },
    PutAll {
        entries: Vec<(Key, Value)>,
        metadata: Metadata,
    },
    Remove {
        key: Key,
        /// Remove only if the current value equals this one.
        expected: Option<Value>,
    },
    Replace {
        key: Key,
        /// Replace only if the current value equals this one.
        expected: Option<Value>,
        value: Value,
        metadata: Metadata,
    },
    Clear,
}

impl WriteCommand {
    pub fn put(key: Key, value: Value, metadata: Metadata) -> Self {
        WriteCommand::Put {
            key,
            value,
            metadata,
            put_if_absent: false,
            ignore_return: false,
        }
    }

    pub fn put_if_absent(key: Key, value: Value, metadata: Metadata) -> Self {
        WriteCommand::Put {
            key,
            value,
            metadata,
            put_if_absent: true,
            ignore_return: false,
        }
    }

    /// A put that does not need the previous value.
    pub fn blind_put(key: Key, value: Value, metadata: Metadata) -> Self {
        WriteCommand::Put {
            key,
            value,
            metadata,
            put_if_absent: false,
            ignore_return: true,
        }
    }

    pub fn put_all(entries: Vec<(Key, Value)>, metadata: Metadata) -> Self {
        WriteCommand::PutAll { entries, metadata }
    }

    pub fn remove(key: Key) -> Self {
        WriteCommand::Remove {
            key,
            expected: None,
        }
    }

    pub fn remove_if(key: Key, expected: Value) -> Self {
        WriteCommand::Remove {
            key,
            expected: Some(expected),
        }
    }

    pub fn replace(key: Key, value: Value, metadata: Metadata) -> Self {
        WriteCommand::Replace {
            key,
            expected: None,
            value,
            metadata,
        }
    }

    pub fn replace_if(key: Key, expected: Value, value: Value, metadata: Metadata) -> Self {
        WriteCommand::Replace {
            key,
            expected: Some(expected),
            value,
            metadata,
        }
    }

    /// Keys the command writes. `Clear` works on whatever is wrapped.
    pub fn keys(&self) -> Vec<Key> {
        match self {
            WriteCommand::Put { key, .. }
            | WriteCommand::Remove { key, .. }
            | WriteCommand::Replace { key, .. } => vec![key.clone()],
            WriteCommand::PutAll { entries, .. } => entries.iter().map(|(k, _)| k.clone()).collect(),
            WriteCommand::Clear => Vec::new(),
        }
    }

    /// Whether the previous value must be read before performing the command.
    pub fn reads_previous_value(&self) -> bool {
        match self {
            WriteCommand::Put { ignore_return, .. } => !ignore_return,
            WriteCommand::Remove { .. } | WriteCommand::Replace { .. } => true,
            WriteCommand::PutAll { .. } | WriteCommand::Clear => false,
        }
    }

    pub fn is_conditional(&self) -> bool {
        match self {
            WriteCommand::Put { put_if_absent, .. } => *put_if_absent,
            WriteCommand::Remove { expected, .. } | WriteCommand::Replace { expected, .. } => {
                expected.is_some()
            }
            WriteCommand::PutAll { .. } | WriteCommand::Clear => false,
        }
    }

    /// Applies the command to the entries wrapped in `ctx`.
    ///
    /// Conditions are only evaluated for locally originated contexts; a replay
    /// on a remote owner applies the outcome the originator already decided,
    /// since only successful commands are ever shipped.
    ///
    /// # Errors
    ///
    /// Fails when a locally originated command touches a key that was not
    /// wrapped in `ctx` beforehand.
    pub fn perform(&self, ctx: &mut InvocationContext) -> Result<CommandOutcome> {
        let local = ctx.is_origin_local();
        match self {
            WriteCommand::Put {
                key,
                value,
                metadata,
                put_if_absent,
                ..
            } => {
                let entry = ctx.entry_for_write(key)?;
                let previous = entry.value().cloned();
                if local && *put_if_absent && previous.is_some() {
                    return Ok(CommandOutcome::failure(CommandReturn::Value(previous)));
                }
                entry.set_value(value.clone(), *metadata);
                Ok(CommandOutcome::success(CommandReturn::Value(previous)))
            }
            WriteCommand::PutAll { entries, metadata } => {
                for (key, value) in entries {
                    ctx.entry_for_write(key)?.set_value(value.clone(), *metadata);
                }
                Ok(CommandOutcome::success(CommandReturn::None))
            }
            WriteCommand::Remove { key, expected } => {
                let entry = ctx.entry_for_write(key)?;
                let previous = entry.value().cloned();
                if !local {
                    entry.remove();
                    return Ok(CommandOutcome::success(CommandReturn::Value(previous)));
                }
                match expected {
                    Some(expected) if previous.as_ref() == Some(expected) => {
                        entry.remove();
                        Ok(CommandOutcome::success(CommandReturn::Bool(true)))
                    }
                    Some(_) => Ok(CommandOutcome::failure(CommandReturn::Bool(false))),
                    None if previous.is_none() => {
                        Ok(CommandOutcome::failure(CommandReturn::Value(None)))
                    }
                    None => {
                        entry.remove();
                        Ok(CommandOutcome::success(CommandReturn::Value(previous)))
                    }
                }
            }
            WriteCommand::Replace {
                key,
                expected,
                value,
                metadata,
            } => {
                let entry = ctx.entry_for_write(key)?;
                let previous = entry.value().cloned();
                if !local {
                    entry.set_value(value.clone(), *metadata);
                    return Ok(CommandOutcome::success(CommandReturn::Value(previous)));
                }
                match (expected, previous) {
                    (Some(_), None) => Ok(CommandOutcome::failure(CommandReturn::Bool(false))),
                    (None, None) => Ok(CommandOutcome::failure(CommandReturn::Value(None))),
                    (Some(expected), Some(current)) if &current != expected => {
                        Ok(CommandOutcome::failure(CommandReturn::Bool(false)))
                    }
                    (Some(_), Some(_)) => {
                        entry.set_value(value.clone(), *metadata);
                        Ok(CommandOutcome::success(CommandReturn::Bool(true)))
                    }
                    (None, Some(current)) => {
                        entry.set_value(value.clone(), *metadata);
                        Ok(CommandOutcome::success(CommandReturn::Value(Some(current))))
                    }
                }
            }
            WriteCommand::Clear => {
                for entry in ctx.entries_mut() {
                    if !entry.is_null() {
                        entry.remove();
                    }
                }
                Ok(CommandOutcome::success(CommandReturn::None))
            }
        }
    }
}
