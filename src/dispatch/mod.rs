//! Request dispatch into isolated execution units.

pub mod bridge;
mod unit;

pub use bridge::{Dispatcher, ExecutionUnit, UnitFactory};
pub use unit::{
    Endpoint, GatewayUnit, GatewayUnitFactory, Reply, RequestDescriptor, SESSION_COOKIE_NAME,
    TEST_COOKIE_NAME, UnitServices,
};

/// The dispatcher serving the SAML endpoints.
pub type GatewayDispatcher = Dispatcher<GatewayUnitFactory>;
