use crate::commands::remote::{ReplicableCommand, Response};
use crate::errors::{MnemosyneError, Result};

/// Converts remote commands and responses to and from their wire form.
pub trait Marshaller: Send + Sync {
    fn marshal_command(&self, command: &ReplicableCommand) -> Result<Vec<u8>>;

    fn unmarshal_command(&self, bytes: &[u8]) -> Result<ReplicableCommand>;

    fn marshal_response(&self, response: &Response) -> Result<Vec<u8>>;

    fn unmarshal_response(&self, bytes: &[u8]) -> Result<Response>;
}

/// [`Marshaller`] backed by `bincode`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeMarshaller;

impl Marshaller for BincodeMarshaller {
    fn marshal_command(&self, command: &ReplicableCommand) -> Result<Vec<u8>> {
        bincode::serialize(command).map_err(|e| MnemosyneError::Marshalling(e.to_string()))
    }

    fn unmarshal_command(&self, bytes: &[u8]) -> Result<ReplicableCommand> {
        bincode::deserialize(bytes).map_err(|e| MnemosyneError::Marshalling(e.to_string()))
    }

    fn marshal_response(&self, response: &Response) -> Result<Vec<u8>> {
        bincode::serialize(response).map_err(|e| MnemosyneError::Marshalling(e.to_string()))
    }

    fn unmarshal_response(&self, bytes: &[u8]) -> Result<Response> {
        bincode::deserialize(bytes).map_err(|e| MnemosyneError::Marshalling(e.to_string()))
    }
}
