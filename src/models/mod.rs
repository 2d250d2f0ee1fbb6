pub mod campaign;
pub mod event;
pub mod ids;
pub mod ledger;
pub mod reply;
pub mod wire;
