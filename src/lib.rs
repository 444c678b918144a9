pub mod audit;
pub mod config;
pub mod decision;
pub mod entropy;
pub mod events;
pub mod ledger;
pub mod logging;
pub mod market;
pub mod money;
pub mod oracle;
pub mod tick;
