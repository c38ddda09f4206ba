mod account;
mod config;
mod locks;
mod reconcile;
mod store;
mod transaction;
mod transfer;

pub use self::{
    account::{Account, AccountNumber},
    config::{EngineConfig, DEFAULT_INITIAL_CREDIT},
    store::Store,
    transfer::{Cancellation, TransferEngine, TransferRequest},
};
