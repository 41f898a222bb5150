// sharewatch/src/enforce/mod.rs
//
// Outbound side effects: firewall rules, credential provisioning and
// notifications. Each sits behind a trait so the reconciliation loop can be
// driven against recording doubles in tests.

pub mod firewall;
pub mod notify;
pub mod provision;
