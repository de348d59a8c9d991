//! storelane core: document values, deployment identities, the outcome
//! protocol, the error taxonomy and the driver traits.

pub mod driver;
pub mod error;
pub mod identity;
pub mod outcome;
pub mod types;

pub use driver::{
    Collection, ConnectTarget, Connector, Credentials, CursorCall, Database, DirectCall,
    DocumentStream,
};
pub use error::{DispatchError, ErrorKind};
pub use identity::{ConsumerId, DeploymentIdentity};
pub use outcome::{Outcome, OutcomeSink, Payload};
pub use types::Value;

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
