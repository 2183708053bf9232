use ahash::AHashMap as HashMap;
use log::debug;

use crate::NodeId;
use crate::commands::CommandReturn;
use crate::commands::remote::Response;
use crate::errors::{MnemosyneError, Result};

/// Responses gathered for one invocation, keyed by the answering member.
pub type Responses = HashMap<NodeId, Response>;

/// Decides when an invocation is complete and what it completes with.
///
/// The invocation feeds every response (including synthesized
/// [`Response::Leaver`] entries for departed targets) to the collector. The
/// collector may short-circuit by returning `Some`; otherwise
/// [`ResponseCollector::finish`] is called once every target was accounted for.
pub trait ResponseCollector: Send {
    fn add_response(&mut self, sender: NodeId, response: Response) -> Option<Result<Responses>>;

    fn finish(&mut self) -> Result<Responses>;
}

/// Waits for every target and fails on the first exception.
pub struct MapResponseCollector {
    ignore_leavers: bool,
    responses: Responses,
}

impl MapResponseCollector {
    /// # Arguments
    ///
    /// * `ignore_leavers` - When `true`, a target leaving the view counts as
    ///   answered. When `false`, it fails the invocation with
    ///   `MnemosyneError::SuspectedLeaver`.
    pub fn new(ignore_leavers: bool) -> Self {
        Self {
            ignore_leavers,
            responses: HashMap::new(),
        }
    }
}

impl ResponseCollector for MapResponseCollector {
    fn add_response(&mut self, sender: NodeId, response: Response) -> Option<Result<Responses>> {
        match response {
            Response::Exception(failure) => Some(Err(failure.into_error(sender))),
            Response::Leaver if self.ignore_leavers => {
                debug!("Ignoring leaver {}", sender);
                self.responses.insert(sender, Response::Leaver);
                None
            }
            Response::Leaver => Some(Err(MnemosyneError::SuspectedLeaver { node: sender })),
            other => {
                self.responses.insert(sender, other);
                None
            }
        }
    }

    fn finish(&mut self) -> Result<Responses> {
        Ok(std::mem::take(&mut self.responses))
    }
}

/// Completes with the first response that carries a value.
///
/// Used for reads sent to every owner of a key: an owner that answers "absent"
/// (for instance one that became an owner after the entry was written) does
/// not win over an owner that has the entry. Failures and leavers only matter
/// if no owner could answer at all.
#[derive(Default)]
pub struct FirstResponseCollector {
    empty: Option<(NodeId, Response)>,
    failure: Option<MnemosyneError>,
    leaver: Option<NodeId>,
}

impl FirstResponseCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResponseCollector for FirstResponseCollector {
    fn add_response(&mut self, sender: NodeId, response: Response) -> Option<Result<Responses>> {
        match response {
            Response::Successful(CommandReturn::Entry(None))
            | Response::Successful(CommandReturn::Value(None)) => {
                if self.empty.is_none() {
                    self.empty = Some((sender, response));
                }
                None
            }
            Response::Successful(_) => {
                let mut responses = HashMap::new();
                responses.insert(sender, response);
                Some(Ok(responses))
            }
            Response::Exception(failure) => {
                if self.failure.is_none() {
                    self.failure = Some(failure.into_error(sender));
                }
                None
            }
            Response::Leaver => {
                self.leaver.get_or_insert(sender);
                None
            }
        }
    }

    fn finish(&mut self) -> Result<Responses> {
        if let Some((sender, response)) = self.empty.take() {
            let mut responses = HashMap::new();
            responses.insert(sender, response);
            return Ok(responses);
        }
        if let Some(failure) = self.failure.take() {
            return Err(failure);
        }
        match self.leaver {
            Some(node) => Err(MnemosyneError::SuspectedLeaver { node }),
            None => Ok(HashMap::new()),
        }
    }
}
