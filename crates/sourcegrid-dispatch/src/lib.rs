//! sourcegrid-dispatch: delivers lifecycle and status commands to workers.
//!
//! The [`Dispatcher`] bounds every call with a timeout, retries transient
//! failures according to the verb (stop and status freely, start and
//! restart at most once), caps concurrent calls with a semaphore, and
//! honours caller cancellation. Transports plug in through
//! [`WorkerTransport`]; the live node set comes from a [`NodeRegistry`].

pub mod command;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod memory;
pub mod transport;

pub use command::{Command, CommandReply, StartPayload, Verb};
pub use dispatcher::{DispatchConfig, DispatchTarget, Dispatcher};
pub use error::{DispatchError, DispatchResult, RegistryError, TransportError};
pub use http::HttpTransport;
pub use memory::{InMemoryWorkers, SentCommand};
pub use transport::{NodeRegistry, WorkerTransport};
