pub mod anomaly;
pub mod api;
pub mod app;
pub mod entitlement;
pub mod gate;
pub mod limits;
pub mod origin;
pub mod session;
pub mod store;
