//! SAML service-provider side of the gateway.
//!
//! Everything in here runs inside an execution unit: credentials are read
//! fresh from disk for each request, the protocol engine works on immutable
//! descriptors, and the session store opens one connection per write.

pub mod credentials;
mod descriptors;
mod record;
pub mod relay_state;
pub mod saml;
pub mod session_store;
mod verifier;

pub use credentials::{CredentialField, CredentialLoader};
pub use descriptors::{IdentityProviderDescriptor, ServiceProviderDescriptor};
pub use record::{AuthenticationRecord, CookiePolicy, hash_subject};
pub use relay_state::{RelaySigner, RelayState};
pub use saml::{IdentityClaims, LoginRedirect, ValidationOptions};
pub use session_store::{SessionStore, SharedSessionStore, SqlSessionStore, StoredSession};
pub use verifier::{AssertionVerifier, SamaelVerifier, VerifiedAssertion};
