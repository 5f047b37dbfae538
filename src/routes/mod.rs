pub mod health;
mod saml;

pub use saml::service_routes;
