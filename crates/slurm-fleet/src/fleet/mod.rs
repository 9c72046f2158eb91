//! Management of the elastic compute fleet: node naming, observing the provider, deciding and
//! performing the actions requested by the scheduler.
pub mod catalog;
pub mod engine;
pub mod hostname;
pub mod nodedown;
pub mod reconcile;
pub mod retry;
