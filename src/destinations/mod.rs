// Destination implementations for relayed records
//
// Records from the syslog relay and from the Kubernetes tailers end up here
// on their way to the downstream collectors.

pub mod syslog;

pub use syslog::SyslogForwarder;
