//! Person classifier backends.

pub mod remote;

pub use remote::{ClassifierTransport, HttpTransport, RemoteClassifier};
